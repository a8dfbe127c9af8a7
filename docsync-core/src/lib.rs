#![doc = "docsync-core: repository synchronisation engine for docsync."]

//! This crate mirrors markdown documentation from GitHub repositories into a
//! hierarchical content store and keeps the two in sync.
//!
//! # Components (leaves first)
//! - [`github`]: source client over the GitHub REST API
//! - [`transform`]: markup classification, title extraction, link rewriting
//! - [`hierarchy`]: path segments to category chain
//! - [`upsert`]: fingerprinted create/update/skip of content records
//! - [`synchronise`]: full/incremental sync orchestration and sync state
//!
//! Collaborators are injected through the traits in [`contract`]; [`store`]
//! provides an in-memory implementation of the content store.

pub mod config;
pub mod contract;
pub mod error;
pub mod github;
pub mod hierarchy;
pub mod store;
pub mod synchronise;
pub mod transform;
pub mod upsert;
