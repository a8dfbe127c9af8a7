/// # docsync CLI Interface (Module)
///
/// Command parsing and orchestration glue for the `docsync` binary. All sync
/// semantics live in [`docsync-core`]; this module loads config, opens the
/// store snapshot, wires the GitHub client into the synchroniser and prints
/// results.
///
/// ## How To Use
/// - From the shell: `docsync --help`.
/// - From tests: build a [`Cli`] and call [`run`].
///
/// [`docsync-core`]: ../../docsync-core/
use crate::load_config::{load_config, CliConfig, TOKEN_ENV};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docsync_core::contract::{ContentStore, Project};
use docsync_core::error::ConfigError;
use docsync_core::github::GitHubClient;
use docsync_core::store::InMemoryStore;
use docsync_core::synchronise::{self, held_lock, Synchroniser};
use std::path::PathBuf;

/// CLI for docsync: mirror repository markdown docs into a content store.
#[derive(Parser)]
#[clap(
    name = "docsync",
    version,
    about = "Mirror GitHub markdown documentation into a hierarchical content store"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync one project, or every configured project
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Only sync this project id
        #[clap(long)]
        project: Option<u64>,
        /// Rewrite records even when their fingerprint is unchanged
        #[clap(long)]
        force: bool,
    },
    /// Print the sync state of every project
    Status {
        #[clap(long)]
        config: PathBuf,
    },
    /// Clear a project's sync state so the next sync is a full one
    Reset {
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        project: u64,
    },
}

/// Async CLI entrypoint shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync {
            config,
            project,
            force,
        } => {
            let config = load_config(config)?;
            tracing::info!(command = "sync", ?project, force, "Starting synchronisation");
            let store = open_store(&config)?;
            ensure_unlocked(&store, &config).await?;

            let client = GitHubClient::new(&config.sync.github, &config.sync.extension)
                .map_err(|e| match e {
                    ConfigError::MissingToken => {
                        anyhow::anyhow!("{e}: set {TOKEN_ENV} in the environment or .env")
                    }
                    other => anyhow::Error::new(other),
                })?;
            let synchroniser = Synchroniser::new(&client, &store, &config.sync);
            let results = match project {
                Some(id) => vec![synchroniser.sync(id, force).await],
                None => synchroniser.sync_all(force).await?,
            };
            save_store(&store, &config)?;

            println!("{}", serde_json::to_string_pretty(&results)?);
            let failed = results.iter().filter(|r| !r.success).count();
            if failed > 0 {
                tracing::error!(command = "sync", failed, total = results.len(), "Synchronisation failed");
                anyhow::bail!("{failed} of {} project syncs failed", results.len());
            }
            tracing::info!(command = "sync", total = results.len(), "Synchronisation complete");
            Ok(())
        }
        Commands::Status { config } => {
            let config = load_config(config)?;
            // Read-only: a running sync owns the snapshot.
            let store = open_store(&config)?;
            let projects: Vec<Project> = store.list_projects().await?;
            println!("{}", serde_json::to_string_pretty(&projects)?);
            Ok(())
        }
        Commands::Reset { config, project } => {
            let config = load_config(config)?;
            let store = open_store(&config)?;
            ensure_unlocked(&store, &config).await?;
            synchronise::reset(&store, project).await?;
            save_store(&store, &config)?;
            tracing::info!(command = "reset", project, "Project sync state cleared");
            println!("reset project {project}");
            Ok(())
        }
    }
}

/// Loads the snapshot and registers every configured project.
fn open_store(config: &CliConfig) -> Result<InMemoryStore> {
    let store = InMemoryStore::open(&config.store_path)
        .with_context(|| format!("Failed to open store {}", config.store_path.display()))?;
    for entry in &config.projects {
        let project = store.ensure_project(
            &entry.name,
            &entry.repo_url,
            &entry.docs_dir,
            entry.branch.as_deref(),
        )?;
        tracing::debug!(project_id = project.id, name = %project.name, "Project registered");
    }
    Ok(store)
}

/// Refuses to touch a snapshot another process is syncing into.
///
/// All projects share one snapshot file, so any fresh lock blocks the command.
async fn ensure_unlocked(store: &InMemoryStore, config: &CliConfig) -> Result<()> {
    let now = chrono::Utc::now();
    for project in store.list_projects().await? {
        if let Some(started) = held_lock(&project.sync, now, config.sync.lock_stale_after_secs) {
            tracing::warn!(project_id = project.id, %started, "Snapshot is locked by a running sync");
            anyhow::bail!(
                "sync already in progress for project {} since {}; store {} is locked",
                project.id,
                started.to_rfc3339(),
                config.store_path.display()
            );
        }
    }
    Ok(())
}

fn save_store(store: &InMemoryStore, config: &CliConfig) -> Result<()> {
    store
        .save(&config.store_path)
        .with_context(|| format!("Failed to save store {}", config.store_path.display()))
}
