/// `load_config` module: reads the static YAML config and injects secrets from the environment.
///
/// This is the only place where user-supplied YAML is parsed. The file never
/// carries the GitHub token; it comes from `GITHUB_TOKEN` (a `.env` file is
/// loaded by the binary before this runs).
///
/// # Accepted layout
/// ```yaml
/// store_path: ./state/store.json
/// github:
///   api_base: https://api.github.com
///   timeout_secs: 30
/// sync:
///   default_branch: main
///   resolve_forward_links: true
/// projects:
///   - name: Handbook
///     repo_url: https://github.com/acme/handbook
///     docs_dir: docs
///     branch: main
/// ```
///
/// # Errors
/// All errors use `anyhow::Error` with the config path in the context; they
/// surface at the CLI boundary.
use anyhow::{Context, Result};
use docsync_core::config::{GitHubConfig, SyncConfig, DEFAULT_DOCS_DIR};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const TOKEN_ENV: &str = "GITHUB_TOKEN";

#[derive(Debug)]
pub struct CliConfig {
    /// JSON snapshot of the content store.
    pub store_path: PathBuf,
    pub sync: SyncConfig,
    pub projects: Vec<ProjectEntry>,
}

/// A repository docs directory to mirror.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    pub repo_url: String,
    #[serde(default = "default_docs_dir")]
    pub docs_dir: String,
    #[serde(default)]
    pub branch: Option<String>,
}

fn default_docs_dir() -> String {
    DEFAULT_DOCS_DIR.to_string()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    store_path: PathBuf,
    #[serde(default)]
    github: GitHubConfig,
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

/// Loads the YAML config at `path` and injects `GITHUB_TOKEN` when set.
///
/// A missing token is not an error here: only `sync` needs it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })?;

    let mut sync = raw.sync;
    sync.github = raw.github;
    sync.github.token = std::env::var(TOKEN_ENV)
        .ok()
        .filter(|token| !token.trim().is_empty());
    if sync.github.token.is_none() {
        warn!("{TOKEN_ENV} is not set; sync will refuse to start");
    }
    sync.validate()
        .with_context(|| format!("Invalid sync settings in {}", path_ref.display()))?;
    sync.trace_loaded();

    for project in &raw.projects {
        if project.name.trim().is_empty() || project.repo_url.trim().is_empty() {
            anyhow::bail!(
                "Every project needs a name and a repo_url (config {})",
                path_ref.display()
            );
        }
    }
    info!(
        config_path = ?path_ref,
        projects = raw.projects.len(),
        "Parsed config YAML successfully"
    );

    Ok(CliConfig {
        store_path: raw.store_path,
        sync,
        projects: raw.projects,
    })
}
