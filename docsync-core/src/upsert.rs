use serde::Serialize;
use tracing::{debug, info};

use crate::contract::{ContentStore, NewRecord, RecordUpdate};
use crate::error::SyncError;
use crate::hierarchy;
use crate::transform;

/// Everything needed to write one synced document.
#[derive(Debug, Clone)]
pub struct UpsertRequest {
    pub source_file: String,
    pub title: String,
    pub body: String,
    pub project_id: u64,
    pub filesize: u64,
    pub source_timestamp: String,
    /// Category names below the project, outermost first.
    pub subpath: Vec<String>,
    /// Rewrite even when the fingerprint matches.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub record_id: u64,
    pub permalink: String,
}

/// Create, update or skip the record for `req.source_file`.
///
/// The fingerprint `(filesize, source_timestamp)` short-circuits unchanged
/// files without touching the record. Writes are not transactional: a
/// failure between the update and the category attach leaves both halves as
/// they were written.
pub async fn upsert<C>(store: &C, req: UpsertRequest) -> Result<UpsertOutcome, SyncError>
where
    C: ContentStore + ?Sized,
{
    let leaf_id = hierarchy::resolve(store, req.project_id, &req.subpath, true).await?;
    let excerpt = transform::excerpt(&req.body);

    match store.find_record(req.project_id, &req.source_file).await? {
        Some(existing)
            if !req.force
                && existing.filesize == req.filesize
                && existing.source_timestamp == req.source_timestamp =>
        {
            debug!(
                source_file = %req.source_file,
                record_id = existing.id,
                "Fingerprint unchanged, skipping write"
            );
            Ok(UpsertOutcome {
                action: UpsertAction::Unchanged,
                record_id: existing.id,
                permalink: existing.permalink,
            })
        }
        Some(existing) => {
            let updated = store
                .update_record(
                    existing.id,
                    RecordUpdate {
                        title: req.title,
                        body: req.body,
                        excerpt,
                        filesize: req.filesize,
                        source_timestamp: req.source_timestamp,
                    },
                )
                .await?;
            if existing.category_id != leaf_id {
                store.attach_record(updated.id, leaf_id).await?;
            }
            info!(
                source_file = %req.source_file,
                record_id = updated.id,
                category_id = leaf_id,
                "Updated record"
            );
            Ok(UpsertOutcome {
                action: UpsertAction::Updated,
                record_id: updated.id,
                permalink: updated.permalink,
            })
        }
        None => {
            let created = store
                .create_record(NewRecord {
                    title: req.title,
                    body: req.body,
                    excerpt,
                    category_id: leaf_id,
                    source_file: req.source_file.clone(),
                    filesize: req.filesize,
                    source_timestamp: req.source_timestamp,
                })
                .await?;
            info!(
                source_file = %req.source_file,
                record_id = created.id,
                category_id = leaf_id,
                "Created record"
            );
            Ok(UpsertOutcome {
                action: UpsertAction::Created,
                record_id: created.id,
                permalink: created.permalink,
            })
        }
    }
}
