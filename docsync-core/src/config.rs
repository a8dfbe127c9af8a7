use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_DOCS_DIR: &str = "docs";
pub const DEFAULT_EXTENSION: &str = ".md";

/// Connection settings for the GitHub REST API.
#[derive(Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bearer token; injected from the environment, never read from config files.
    #[serde(skip)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: None,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("api_base", &self.api_base)
            .field("token_set", &self.token.is_some())
            .field("timeout_secs", &self.timeout_secs)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Engine-wide settings passed explicitly to the orchestrator.
///
/// `github` is configured at the top level of the file and copied in by the
/// loader, so it is never read from this section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(skip)]
    pub github: GitHubConfig,
    /// Branch used for projects that do not name one.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Only files whose name ends with this are synced.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Prefix for links to documents that have no record yet.
    #[serde(default = "default_fallback_link_prefix")]
    pub fallback_link_prefix: String,
    /// Re-resolve fallback links once every record of the run exists.
    #[serde(default = "default_true")]
    pub resolve_forward_links: bool,
    /// A `syncing` project older than this is considered abandoned.
    #[serde(default = "default_lock_stale_after_secs")]
    pub lock_stale_after_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            github: GitHubConfig::default(),
            default_branch: default_branch(),
            extension: default_extension(),
            fallback_link_prefix: default_fallback_link_prefix(),
            resolve_forward_links: true,
            lock_stale_after_secs: default_lock_stale_after_secs(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.extension.starts_with('.') || self.extension.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "extension must look like '.md', got '{}'",
                self.extension
            )));
        }
        if self.default_branch.trim().is_empty() {
            return Err(ConfigError::Invalid("default_branch is empty".into()));
        }
        if self.github.timeout_secs == 0 {
            return Err(ConfigError::Invalid("github.timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            api_base = %self.github.api_base,
            default_branch = %self.default_branch,
            extension = %self.extension,
            resolve_forward_links = self.resolve_forward_links,
            "Loaded SyncConfig"
        );
        debug!(?self, "SyncConfig loaded (full debug)");
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("docsync/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_fallback_link_prefix() -> String {
    "/docs".to_string()
}

fn default_true() -> bool {
    true
}

fn default_lock_stale_after_secs() -> u64 {
    900
}
