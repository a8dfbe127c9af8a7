//! Error types shared by every docsync-core component.
//!
//! The taxonomy follows how failures are handled by the orchestrator:
//! - [`ConfigError`]: fail fast, no work attempted
//! - [`SourceError`]: aborts the current sync step, becomes the terminal error
//! - [`ContentError`] / [`StoreError`]: scoped to a single file, the batch continues

/// Errors returned by a [`crate::contract::SourceClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The requested ref, path or object does not exist, or the payload was empty.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// Connection failures, timeouts and any other non-2xx response.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The remote cut the listing short; acting on it would miss files.
    #[error("incomplete listing: {0}")]
    Truncated(String),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

/// Errors produced while turning a raw file into storable content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("no level-1 title header found in {0}")]
    MissingTitle(String),
}

/// Errors returned by a [`crate::contract::ContentStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Configuration problems detected before any sync work starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no API token configured for the source repository")]
    MissingToken,

    #[error("cannot parse repository owner/name from URL '{0}'")]
    MalformedRepoUrl(String),

    #[error("project {0} does not exist")]
    UnknownProject(u64),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error for engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("category '{name}' not found under parent {parent_id}")]
    CategoryNotFound { parent_id: u64, name: String },
}
