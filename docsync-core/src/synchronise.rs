//! High-level pipeline: decides what changed upstream and mirrors it into the store.
//!
//! This module owns the per-project sync state machine (`never|success|failed
//! -> syncing -> success|failed`) and the two strategies that drive it:
//!   - Full sync: list the whole docs tree at the head commit, upsert every
//!     file, then delete records whose source file is gone (orphans)
//!   - Incremental sync: compare the last synced commit with the head commit
//!     and only touch added, modified, removed and renamed files. A compare
//!     whose base is gone or whose file list is capped falls back to a full sync
//!
//! # Major Types
//! - [`Synchroniser`]: holds the injected [`SourceClient`], [`ContentStore`] and [`SyncConfig`]
//! - [`SyncResult`]: per-invocation diff report returned to callers
//! - [`SyncAccumulator`]: best-effort aggregation of per-file outcomes
//!
//! # Error Handling
//! Best effort, never atomic. Content and store failures are scoped to the
//! file that caused them: the batch continues and the last error becomes the
//! result's error. Source (network/auth) failures stop the run, except a
//! missing blob, which only fails its file. Nothing that was already written
//! is rolled back, so a failed result does not mean nothing changed. Nothing
//! is retried.
//!
//! # Concurrency
//! One `sync` call awaits every request in turn. An advisory lock in the
//! project's sync state (`syncing` + `sync_started_at`) makes a second
//! concurrent call for the same project bail out until the lock goes stale.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::contract::{ContentStore, Project, RecordUpdate, SourceClient, SyncState, SyncStatus};
use crate::error::{ConfigError, SourceError, SyncError};
use crate::github::parse_repo_url;
use crate::transform::{self, LinkRewriter, ProcessedContent};
use crate::upsert::{upsert, UpsertAction, UpsertOutcome, UpsertRequest};

/// Report of one `sync` invocation. Only its effects are persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub project_id: u64,
    pub success: bool,
    /// The head commit equals the last synced commit; nothing was done.
    pub no_changes: bool,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub renamed: Vec<String>,
    pub unchanged: Vec<String>,
    pub old_sha: Option<String>,
    pub new_sha: Option<String>,
    pub error: Option<String>,
}

impl SyncResult {
    fn failed(project_id: u64, old_sha: Option<&str>, error: impl ToString) -> Self {
        Self {
            project_id,
            success: false,
            old_sha: old_sha.map(str::to_string),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    /// Files this run left in sync with the head commit.
    pub fn files_synced(&self) -> usize {
        self.added.len() + self.updated.len() + self.unchanged.len()
    }
}

/// Collects per-file outcomes; a failure flips `success` but never stops collection.
#[derive(Debug, Default)]
pub struct SyncAccumulator {
    added: Vec<String>,
    updated: Vec<String>,
    removed: Vec<String>,
    renamed: Vec<String>,
    unchanged: Vec<String>,
    failures: usize,
    last_error: Option<String>,
}

impl SyncAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, source_file: &str, action: UpsertAction) {
        let bucket = match action {
            UpsertAction::Created => &mut self.added,
            UpsertAction::Updated => &mut self.updated,
            UpsertAction::Unchanged => &mut self.unchanged,
        };
        bucket.push(source_file.to_string());
    }

    pub fn record_removed(&mut self, source_file: &str) {
        self.removed.push(source_file.to_string());
    }

    pub fn record_renamed(&mut self, source_file: &str) {
        self.renamed.push(source_file.to_string());
    }

    pub fn record_failure(&mut self, source_file: &str, err: &SyncError) {
        error!(source_file, error = %err, "[SYNC][ERROR] File failed");
        self.failures += 1;
        self.last_error = Some(format!("{source_file}: {err}"));
    }

    /// Abort with an error that is not tied to one file.
    pub fn record_fatal(&mut self, err: &SyncError) {
        error!(error = %err, "[SYNC][ERROR] Sync step aborted");
        self.failures += 1;
        self.last_error = Some(err.to_string());
    }

    pub fn successes(&self) -> usize {
        self.added.len()
            + self.updated.len()
            + self.removed.len()
            + self.renamed.len()
            + self.unchanged.len()
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn finish(self, project_id: u64, old_sha: Option<&str>, new_sha: &str) -> SyncResult {
        SyncResult {
            project_id,
            success: self.failures == 0,
            no_changes: false,
            added: self.added,
            updated: self.updated,
            removed: self.removed,
            renamed: self.renamed,
            unchanged: self.unchanged,
            old_sha: old_sha.map(str::to_string),
            new_sha: Some(new_sha.to_string()),
            error: self.last_error,
        }
    }
}

/// Resolved repository coordinates for one run.
struct RepoRun<'p> {
    project: &'p Project,
    owner: String,
    repo: String,
    new_sha: String,
}

/// A record written this run whose body still carries fallback links.
struct PendingRelink {
    source_file: String,
    record_id: u64,
    title: String,
    markdown: String,
    body: String,
    filesize: u64,
    source_timestamp: String,
}

struct FileSync {
    outcome: UpsertOutcome,
    relink: Option<PendingRelink>,
}

/// `source_file -> permalink` for every record known in the project.
type LinkIndex = HashMap<String, String>;

pub struct Synchroniser<'a, S: ?Sized, C: ?Sized> {
    source: &'a S,
    store: &'a C,
    config: &'a SyncConfig,
    rewriter: LinkRewriter,
}

impl<'a, S, C> Synchroniser<'a, S, C>
where
    S: SourceClient + ?Sized,
    C: ContentStore + ?Sized,
{
    pub fn new(source: &'a S, store: &'a C, config: &'a SyncConfig) -> Self {
        Self {
            source,
            store,
            config,
            rewriter: LinkRewriter::new(&config.extension, &config.fallback_link_prefix),
        }
    }

    /// Sync every project the store knows, one after another.
    ///
    /// A failing project does not stop the others.
    pub async fn sync_all(&self, force: bool) -> Result<Vec<SyncResult>, SyncError> {
        let projects = self.store.list_projects().await?;
        info!(projects = projects.len(), force, "[SYNC] Starting batch sync");
        let mut results = Vec::with_capacity(projects.len());
        for project in projects {
            results.push(self.sync(project.id, force).await);
        }
        let failed = results.iter().filter(|r| !r.success).count();
        info!(total = results.len(), failed, "[SYNC] Batch sync finished");
        Ok(results)
    }

    /// Run one sync attempt for `project_id` and persist its terminal state.
    pub async fn sync(&self, project_id: u64, force: bool) -> SyncResult {
        info!(project_id, force, "[SYNC] Starting project sync");

        let project = match self.store.get_project(project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                let err = SyncError::from(ConfigError::UnknownProject(project_id));
                error!(project_id, error = %err, "[SYNC][ERROR] Unresolvable project");
                return SyncResult::failed(project_id, None, err);
            }
            Err(e) => {
                error!(project_id, error = %e, "[SYNC][ERROR] Failed to load project");
                return SyncResult::failed(project_id, None, e);
            }
        };
        let old_sha = project
            .sync
            .last_sync_sha
            .clone()
            .filter(|sha| !sha.trim().is_empty());

        let now = Utc::now();
        if let Some(started) = self.active_lock(&project, now) {
            warn!(project_id, %started, "[SYNC] Another sync holds the project lock");
            return SyncResult::failed(
                project_id,
                old_sha.as_deref(),
                format!("sync already in progress since {}", started.to_rfc3339()),
            );
        }

        let previous = project.sync.clone();
        let syncing = SyncState {
            status: SyncStatus::Syncing,
            sync_started_at: Some(now),
            ..previous.clone()
        };
        if let Err(e) = self.store.update_sync_state(project_id, syncing).await {
            error!(project_id, error = %e, "[SYNC][ERROR] Failed to mark project as syncing");
            return SyncResult::failed(project_id, old_sha.as_deref(), e);
        }

        let mut result = self.run(&project, old_sha.as_deref(), force).await;
        self.persist_outcome(project_id, previous, &mut result).await;

        info!(
            project_id,
            success = result.success,
            no_changes = result.no_changes,
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            renamed = result.renamed.len(),
            unchanged = result.unchanged.len(),
            "[SYNC] Project sync finished"
        );
        result
    }

    pub async fn reset(&self, project_id: u64) -> Result<(), SyncError> {
        reset(self.store, project_id).await
    }

    fn active_lock(&self, project: &Project, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let held = held_lock(&project.sync, now, self.config.lock_stale_after_secs);
        if held.is_none() && project.sync.status == SyncStatus::Syncing {
            warn!(project_id = project.id, started = ?project.sync.sync_started_at, "[SYNC] Stale sync lock, taking over");
        }
        held
    }

    async fn persist_outcome(&self, project_id: u64, previous: SyncState, result: &mut SyncResult) {
        let state = if result.success {
            SyncState {
                last_sync_sha: result.new_sha.clone().or(previous.last_sync_sha),
                last_sync_time: Some(Utc::now()),
                files_synced: if result.no_changes {
                    previous.files_synced
                } else {
                    result.files_synced()
                },
                status: SyncStatus::Success,
                last_error: None,
                sync_started_at: None,
            }
        } else {
            SyncState {
                status: SyncStatus::Failed,
                last_error: result.error.clone(),
                sync_started_at: None,
                ..previous
            }
        };
        if let Err(e) = self.store.update_sync_state(project_id, state).await {
            error!(project_id, error = %e, "[SYNC][ERROR] Failed to persist sync state");
            result.success = false;
            result.error = Some(format!("failed to persist sync state: {e}"));
        }
    }

    async fn run(&self, project: &Project, old_sha: Option<&str>, force: bool) -> SyncResult {
        let (owner, repo) = match parse_repo_url(&project.repo_url) {
            Ok(parts) => parts,
            Err(e) => {
                error!(project_id = project.id, error = %e, "[SYNC][ERROR] Bad repository URL");
                return SyncResult::failed(project.id, old_sha, e);
            }
        };
        let branch = project
            .branch
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or(&self.config.default_branch);

        let new_sha = match self.source.latest_commit(&owner, &repo, branch).await {
            Ok(sha) if !sha.trim().is_empty() => sha,
            Ok(_) => {
                let err = SourceError::NotFound(format!("empty commit SHA for {owner}/{repo}@{branch}"));
                return SyncResult::failed(project.id, old_sha, err);
            }
            Err(e) => {
                error!(project_id = project.id, error = %e, "[SYNC][ERROR] Could not resolve latest commit");
                return SyncResult::failed(project.id, old_sha, e);
            }
        };

        if old_sha == Some(new_sha.as_str()) && !force {
            info!(project_id = project.id, sha = %new_sha, "[SYNC] No changes since last sync");
            return SyncResult {
                project_id: project.id,
                success: true,
                no_changes: true,
                old_sha: old_sha.map(str::to_string),
                new_sha: Some(new_sha),
                ..SyncResult::default()
            };
        }

        let run = RepoRun {
            project,
            owner,
            repo,
            new_sha,
        };
        match old_sha {
            // A forced run at the same commit has an empty diff; re-list everything instead.
            Some(old) if old != run.new_sha => self.incremental_sync(&run, old, force).await,
            _ => self.full_sync(&run, old_sha, force).await,
        }
    }

    async fn full_sync(&self, run: &RepoRun<'_>, old_sha: Option<&str>, force: bool) -> SyncResult {
        let project = run.project;
        info!(project_id = project.id, sha = %run.new_sha, "[SYNC] Full sync");

        let tree = match self
            .source
            .tree(&run.owner, &run.repo, &project.docs_dir, &run.new_sha)
            .await
        {
            Ok(tree) => tree,
            Err(e) => {
                error!(project_id = project.id, error = %e, "[SYNC][ERROR] Tree listing failed");
                return SyncResult::failed(project.id, old_sha, e);
            }
        };
        if tree.is_empty() {
            warn!(project_id = project.id, docs_dir = %project.docs_dir, "[SYNC] Empty documentation tree");
            return SyncResult::failed(project.id, old_sha, "no documentation files found");
        }

        let mut links = match self.link_index(project.id).await {
            Ok(links) => links,
            Err(e) => return SyncResult::failed(project.id, old_sha, e),
        };
        let mut acc = SyncAccumulator::new();
        let mut pending = Vec::new();

        for (source_file, entry) in &tree {
            match self
                .sync_file(run, source_file, &entry.blob_path, &entry.content_hash, force, &mut links)
                .await
            {
                Ok(file) => {
                    acc.record(source_file, file.outcome.action);
                    pending.extend(file.relink);
                }
                Err(e) if is_fatal(&e) => {
                    acc.record_fatal(&e);
                    return acc.finish(project.id, old_sha, &run.new_sha);
                }
                Err(e) => acc.record_failure(source_file, &e),
            }
        }

        // Orphans: stored records whose file is no longer in the tree.
        let keep: BTreeSet<&str> = tree.keys().map(String::as_str).collect();
        match self.store.subtree_records(project.id).await {
            Ok(records) => {
                for record in records
                    .into_iter()
                    .filter(|r| !keep.contains(r.source_file.as_str()))
                {
                    match self.store.delete_record(record.id).await {
                        Ok(()) => {
                            info!(source_file = %record.source_file, record_id = record.id, "[SYNC] Deleted orphan record");
                            links.remove(&record.source_file);
                            acc.record_removed(&record.source_file);
                        }
                        Err(e) => acc.record_failure(&record.source_file, &e.into()),
                    }
                }
            }
            Err(e) => acc.record_fatal(&e.into()),
        }

        self.relink(pending, &links, &mut acc).await;
        acc.finish(project.id, old_sha, &run.new_sha)
    }

    async fn incremental_sync(
        &self,
        run: &RepoRun<'_>,
        old_sha: &str,
        force: bool,
    ) -> SyncResult {
        let project = run.project;
        info!(project_id = project.id, base = old_sha, head = %run.new_sha, "[SYNC] Incremental sync");

        let diff = match self
            .source
            .diff(&run.owner, &run.repo, old_sha, &run.new_sha, &project.docs_dir)
            .await
        {
            Ok(diff) => diff,
            // Base commit gone (force-push) or too many changes to list: re-list everything.
            Err(e @ (SourceError::NotFound(_) | SourceError::Truncated(_))) => {
                warn!(project_id = project.id, error = %e, "[SYNC] Commit comparison unusable, falling back to full sync");
                return self.full_sync(run, Some(old_sha), force).await;
            }
            Err(e) => {
                error!(project_id = project.id, error = %e, "[SYNC][ERROR] Commit comparison failed");
                return SyncResult::failed(project.id, Some(old_sha), e);
            }
        };
        if diff.is_empty() {
            debug!(project_id = project.id, "[SYNC] Diff touches no documentation files");
        }

        let mut links = match self.link_index(project.id).await {
            Ok(links) => links,
            Err(e) => return SyncResult::failed(project.id, Some(old_sha), e),
        };
        let mut acc = SyncAccumulator::new();
        let mut pending = Vec::new();
        let fingerprint = |path: &str| {
            diff.blob_shas
                .get(path)
                .cloned()
                .unwrap_or_else(|| run.new_sha.clone())
        };

        for source_file in diff.added.iter().chain(diff.modified.iter()) {
            let blob_path = join_docs_path(&project.docs_dir, source_file);
            match self
                .sync_file(run, source_file, &blob_path, &fingerprint(source_file.as_str()), force, &mut links)
                .await
            {
                Ok(file) => {
                    acc.record(source_file, file.outcome.action);
                    pending.extend(file.relink);
                }
                Err(e) if is_fatal(&e) => {
                    acc.record_fatal(&e);
                    return acc.finish(project.id, Some(old_sha), &run.new_sha);
                }
                Err(e) => acc.record_failure(source_file, &e),
            }
        }

        for source_file in &diff.removed {
            match self.store.find_record(project.id, source_file).await {
                Ok(Some(record)) => match self.store.delete_record(record.id).await {
                    Ok(()) => {
                        info!(source_file = %source_file, record_id = record.id, "[SYNC] Deleted removed record");
                        links.remove(source_file);
                        acc.record_removed(source_file);
                    }
                    Err(e) => acc.record_failure(source_file, &e.into()),
                },
                Ok(None) => {
                    warn!(source_file = %source_file, "[SYNC] Removed upstream but no record stored, skipping");
                }
                Err(e) => acc.record_failure(source_file, &e.into()),
            }
        }

        for rename in &diff.renamed {
            let existing = match self.store.find_record(project.id, &rename.previous).await {
                Ok(existing) => existing,
                Err(e) => {
                    acc.record_failure(&rename.new, &e.into());
                    continue;
                }
            };
            if let Some(record) = &existing {
                if let Err(e) = self.store.rename_record(record.id, &rename.new).await {
                    acc.record_failure(&rename.new, &e.into());
                    continue;
                }
                info!(previous = %rename.previous, new = %rename.new, record_id = record.id, "[SYNC] Renamed record");
                if let Some(permalink) = links.remove(&rename.previous) {
                    links.insert(rename.new.clone(), permalink);
                }
            } else {
                warn!(previous = %rename.previous, new = %rename.new, "[SYNC] Rename source has no record, treating as addition");
            }

            let blob_path = join_docs_path(&project.docs_dir, &rename.new);
            // Renamed files are always rewritten so the record follows its new directory.
            let force_rename = force || existing.is_some();
            match self
                .sync_file(run, &rename.new, &blob_path, &fingerprint(rename.new.as_str()), force_rename, &mut links)
                .await
            {
                Ok(file) if existing.is_some() => {
                    acc.record_renamed(&rename.new);
                    pending.extend(file.relink);
                }
                Ok(file) => {
                    acc.record(&rename.new, file.outcome.action);
                    pending.extend(file.relink);
                }
                Err(e) if is_fatal(&e) => {
                    acc.record_fatal(&e);
                    return acc.finish(project.id, Some(old_sha), &run.new_sha);
                }
                Err(e) => acc.record_failure(&rename.new, &e),
            }
        }

        self.relink(pending, &links, &mut acc).await;
        acc.finish(project.id, Some(old_sha), &run.new_sha)
    }

    /// Fetch, transform and upsert a single file.
    async fn sync_file(
        &self,
        run: &RepoRun<'_>,
        source_file: &str,
        blob_path: &str,
        fingerprint: &str,
        force: bool,
        links: &mut LinkIndex,
    ) -> Result<FileSync, SyncError> {
        let raw = self
            .source
            .content(&run.owner, &run.repo, blob_path, &run.new_sha)
            .await?;
        let text = String::from_utf8_lossy(&raw);
        let (title, markdown) = transform::extract_title(&text, source_file)?;

        let processed = if transform::is_structured_markup(&markdown) {
            debug!(source_file, "Structured markup, storing verbatim");
            ProcessedContent {
                body: markdown.clone(),
                fallback_links: Vec::new(),
            }
        } else {
            self.rewriter
                .process(&markdown, source_file, |path| links.get(path).cloned())
        };

        let outcome = upsert(
            self.store,
            UpsertRequest {
                source_file: source_file.to_string(),
                title: title.clone(),
                body: processed.body.clone(),
                project_id: run.project.id,
                filesize: raw.len() as u64,
                source_timestamp: fingerprint.to_string(),
                subpath: transform::subpath_for(source_file),
                force,
            },
        )
        .await?;
        links.insert(source_file.to_string(), outcome.permalink.clone());
        debug!(source_file, action = ?outcome.action, record_id = outcome.record_id, "File synced");

        let relink = (self.config.resolve_forward_links
            && outcome.action != UpsertAction::Unchanged
            && !processed.fallback_links.is_empty())
        .then(|| PendingRelink {
            source_file: source_file.to_string(),
            record_id: outcome.record_id,
            title,
            markdown,
            body: processed.body,
            filesize: raw.len() as u64,
            source_timestamp: fingerprint.to_string(),
        });
        Ok(FileSync { outcome, relink })
    }

    /// Second pass: re-resolve fallback links now that every record of the run exists.
    async fn relink(&self, pending: Vec<PendingRelink>, links: &LinkIndex, acc: &mut SyncAccumulator) {
        for item in pending {
            let processed = self
                .rewriter
                .process(&item.markdown, &item.source_file, |path| links.get(path).cloned());
            if processed.body == item.body {
                continue;
            }
            let update = RecordUpdate {
                title: item.title,
                excerpt: transform::excerpt(&processed.body),
                body: processed.body,
                filesize: item.filesize,
                source_timestamp: item.source_timestamp,
            };
            match self.store.update_record(item.record_id, update).await {
                Ok(_) => debug!(source_file = %item.source_file, "Resolved forward links"),
                Err(e) => acc.record_failure(&item.source_file, &e.into()),
            }
        }
    }

    async fn link_index(&self, project_id: u64) -> Result<LinkIndex, SyncError> {
        let records = self.store.subtree_records(project_id).await?;
        Ok(records
            .into_iter()
            .map(|r| (r.source_file, r.permalink))
            .collect())
    }
}

/// Start time of a sync lock in `state` that is still fresh at `now`.
///
/// A `syncing` state without a start time, or one older than
/// `stale_after_secs`, holds no lock.
pub fn held_lock(
    state: &SyncState,
    now: DateTime<Utc>,
    stale_after_secs: u64,
) -> Option<DateTime<Utc>> {
    if state.status != SyncStatus::Syncing {
        return None;
    }
    let started = state.sync_started_at?;
    let elapsed = (now - started).num_seconds();
    (elapsed >= 0 && (elapsed as u64) < stale_after_secs).then_some(started)
}

/// Forget the last synced commit so the next run is a full sync.
///
/// Records are left alone; the next full sync re-fingerprints them.
pub async fn reset<C>(store: &C, project_id: u64) -> Result<(), SyncError>
where
    C: ContentStore + ?Sized,
{
    if store.get_project(project_id).await?.is_none() {
        return Err(ConfigError::UnknownProject(project_id).into());
    }
    store
        .update_sync_state(project_id, SyncState::default())
        .await?;
    info!(project_id, "[SYNC] Sync state reset");
    Ok(())
}

/// Errors that end the whole run rather than a single file.
///
/// A blob that vanished between listing and fetch only fails its own file.
fn is_fatal(err: &SyncError) -> bool {
    match err {
        SyncError::Source(e) => !e.is_not_found(),
        SyncError::Config(_) => true,
        _ => false,
    }
}

fn join_docs_path(docs_dir: &str, source_file: &str) -> String {
    let dir = docs_dir.trim_matches('/');
    if dir.is_empty() || dir == "." {
        source_file.to_string()
    } else {
        format!("{dir}/{source_file}")
    }
}
