//! # contract: collaborator interfaces consumed by the sync engine
//!
//! This module defines the two seams the engine is built around and the plain
//! data types that cross them:
//!
//! - [`SourceClient`]: read-only access to a remote repository (commit, tree,
//!   file content, two-commit diff).
//! - [`ContentStore`]: category and content-record CRUD plus project sync state.
//!
//! ## Interface & Extensibility
//! - All methods are async and return typed errors from [`crate::error`].
//! - Implement [`SourceClient`] for another forge, or [`ContentStore`] for a
//!   real CMS backend; the orchestrator only ever talks to these traits.
//!
//! ## Mocking & Testing
//! - Both traits are annotated for `mockall`, so tests can script the remote
//!   repository deterministically and pair it with [`crate::store::InMemoryStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{SourceError, StoreError};

/// Lifecycle status of a project's last sync attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Never,
    Syncing,
    Success,
    Failed,
}

/// Persisted sync bookkeeping for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_sha: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub files_synced: usize,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    /// Set while a sync is running; acts as an advisory lock.
    #[serde(default)]
    pub sync_started_at: Option<DateTime<Utc>>,
}

/// A top-level category node representing one tracked repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub name: String,
    pub slug: String,
    pub repo_url: String,
    /// Subdirectory of the repository holding the documentation.
    pub docs_dir: String,
    /// Branch to track; `None` means the configured default branch.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sync: SyncState,
}

/// A node in the category hierarchy. `parent_id == 0` marks a project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
    pub slug: String,
    pub parent_id: u64,
}

/// One synced document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub category_id: u64,
    /// Public address assigned by the store.
    pub permalink: String,
    /// Path relative to the project's docs dir; identity within the project subtree.
    pub source_file: String,
    pub filesize: u64,
    pub source_timestamp: String,
}

/// Data needed to create a content record attached to a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub category_id: u64,
    pub source_file: String,
    pub filesize: u64,
    pub source_timestamp: String,
}

/// Replacement content and sync metadata for an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub filesize: u64,
    pub source_timestamp: String,
}

/// A blob in the remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Full path inside the repository, usable with [`SourceClient::content`].
    pub blob_path: String,
    /// Blob SHA reported by the remote.
    pub content_hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedFile {
    pub previous: String,
    pub new: String,
}

/// Files changed between two commits, relative to the docs dir.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub renamed: Vec<RenamedFile>,
    /// Blob SHA per added/modified/renamed-to path, when the remote reports one.
    pub blob_shas: BTreeMap<String, String>,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.renamed.is_empty()
    }
}

/// Read-only access to a remote repository.
///
/// Implementations never retry and never cache: every call is one live round
/// trip bounded by a per-request timeout.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Resolve a branch name to its head commit SHA.
    async fn latest_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, SourceError>;

    /// List document blobs under `path` at `reference`, keyed by path relative to `path`.
    async fn tree(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<BTreeMap<String, TreeEntry>, SourceError>;

    /// Fetch and decode the raw bytes of one blob at `reference`.
    async fn content(
        &self,
        owner: &str,
        repo: &str,
        blob_path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, SourceError>;

    /// Compare two commits, restricted to document files under `path`.
    async fn diff(
        &self,
        owner: &str,
        repo: &str,
        base_sha: &str,
        head_sha: &str,
        path: &str,
    ) -> Result<FileDiff, SourceError>;
}

/// Storage operations the engine needs from the hierarchical content store.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_project(&self, project_id: u64) -> Result<Option<Project>, StoreError>;

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    async fn update_sync_state(&self, project_id: u64, state: SyncState)
        -> Result<(), StoreError>;

    /// Find a direct child of `parent_id` whose name matches case-insensitively.
    ///
    /// When several children match, the first in the store's own ordering wins.
    async fn find_category_child(
        &self,
        parent_id: u64,
        name: &str,
    ) -> Result<Option<Category>, StoreError>;

    async fn create_category(
        &self,
        parent_id: u64,
        name: &str,
        slug: &str,
    ) -> Result<Category, StoreError>;

    /// Look up a record by `source_file`, scoped to the subtree of `project_id`.
    async fn find_record(
        &self,
        project_id: u64,
        source_file: &str,
    ) -> Result<Option<ContentRecord>, StoreError>;

    async fn create_record(&self, record: NewRecord) -> Result<ContentRecord, StoreError>;

    async fn update_record(
        &self,
        record_id: u64,
        update: RecordUpdate,
    ) -> Result<ContentRecord, StoreError>;

    /// Change a record's `source_file` identity in place.
    async fn rename_record(&self, record_id: u64, source_file: &str) -> Result<(), StoreError>;

    async fn attach_record(&self, record_id: u64, category_id: u64) -> Result<(), StoreError>;

    async fn delete_record(&self, record_id: u64) -> Result<(), StoreError>;

    /// All records attached anywhere under the project's category subtree.
    async fn subtree_records(&self, project_id: u64) -> Result<Vec<ContentRecord>, StoreError>;
}
