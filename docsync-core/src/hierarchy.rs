use tracing::{debug, info};

use crate::contract::ContentStore;
use crate::error::SyncError;
use crate::transform::slugify;

/// Walk (and optionally build) the category chain `names` under `project_root_id`.
///
/// Each name is matched case-insensitively against the children of the current
/// node. Returns the id of the deepest node; an empty chain resolves to the
/// project root itself. If the store holds duplicate sibling names, whichever
/// child the store returns first wins.
pub async fn resolve<C>(
    store: &C,
    project_root_id: u64,
    names: &[String],
    create_missing: bool,
) -> Result<u64, SyncError>
where
    C: ContentStore + ?Sized,
{
    let mut parent_id = project_root_id;
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match store.find_category_child(parent_id, name).await? {
            Some(existing) => {
                debug!(parent_id, name, category_id = existing.id, "Descending into category");
                parent_id = existing.id;
            }
            None if create_missing => {
                let created = store
                    .create_category(parent_id, name, &slugify(name))
                    .await?;
                info!(parent_id, name, category_id = created.id, "Created category");
                parent_id = created.id;
            }
            None => {
                return Err(SyncError::CategoryNotFound {
                    parent_id,
                    name: name.to_string(),
                });
            }
        }
    }
    Ok(parent_id)
}
