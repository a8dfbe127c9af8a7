//! In-memory [`ContentStore`] with optional JSON snapshots.
//!
//! Data lives behind a single `RwLock`. Projects, categories and records share
//! one id sequence, so a project id doubles as the root category id. The CLI
//! opens a snapshot with [`InMemoryStore::open`], which writes every sync state
//! transition straight back to disk so another process sees the `syncing`
//! lock; the full snapshot is saved again after the run. Tests use the store
//! directly.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::{
    Category, ContentRecord, ContentStore, NewRecord, Project, RecordUpdate, SyncState,
};
use crate::error::StoreError;
use crate::transform::slugify;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    last_id: u64,
    projects: BTreeMap<u64, Project>,
    categories: Vec<Category>,
    records: BTreeMap<u64, ContentRecord>,
}

impl StoreData {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn category_exists(&self, id: u64) -> bool {
        self.projects.contains_key(&id) || self.categories.iter().any(|c| c.id == id)
    }

    /// Ids of the project root and every category below it.
    fn subtree(&self, project_id: u64) -> HashSet<u64> {
        let mut ids = HashSet::from([project_id]);
        let mut frontier = vec![project_id];
        while let Some(parent) = frontier.pop() {
            for child in self.categories.iter().filter(|c| c.parent_id == parent) {
                if ids.insert(child.id) {
                    frontier.push(child.id);
                }
            }
        }
        ids
    }

    fn record_mut(&mut self, record_id: u64) -> Result<&mut ContentRecord, StoreError> {
        self.records
            .get_mut(&record_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "record",
                id: record_id.to_string(),
            })
    }
}

/// Thread-safe in-memory content store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<StoreData>,
    /// Written through on every sync state change when set.
    snapshot: Option<PathBuf>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`InMemoryStore::save`]; a missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            info!(path = %path.display(), "No store snapshot yet, starting empty");
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Backend(format!("read {}: {e}", path.display())))?;
        let data: StoreData = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Backend(format!("parse {}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            projects = data.projects.len(),
            records = data.records.len(),
            "Loaded store snapshot"
        );
        Ok(Self {
            data: RwLock::new(data),
            snapshot: None,
        })
    }

    /// Like [`InMemoryStore::load`], but sync state changes are persisted to `path` immediately.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut store = Self::load(path)?;
        store.snapshot = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = {
            let data = self.read()?;
            serde_json::to_string_pretty(&*data)
                .map_err(|e| StoreError::Backend(format!("serialize store: {e}")))?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(path, json)
            .map_err(|e| StoreError::Backend(format!("write {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Saved store snapshot");
        Ok(())
    }

    /// Register a new project root. Sync state starts as `never`.
    pub fn create_project(
        &self,
        name: &str,
        repo_url: &str,
        docs_dir: &str,
        branch: Option<&str>,
    ) -> Result<Project, StoreError> {
        let mut data = self.write()?;
        let project = Project {
            id: data.next_id(),
            name: name.to_string(),
            slug: slugify(name),
            repo_url: repo_url.to_string(),
            docs_dir: docs_dir.to_string(),
            branch: branch.map(str::to_string),
            sync: SyncState::default(),
        };
        data.projects.insert(project.id, project.clone());
        info!(project_id = project.id, name, repo_url, "Created project");
        Ok(project)
    }

    /// Return the project tracking `repo_url` + `docs_dir`, creating it if needed.
    ///
    /// Name and branch of an existing project are refreshed; its sync state is kept.
    pub fn ensure_project(
        &self,
        name: &str,
        repo_url: &str,
        docs_dir: &str,
        branch: Option<&str>,
    ) -> Result<Project, StoreError> {
        {
            let mut data = self.write()?;
            if let Some(existing) = data
                .projects
                .values_mut()
                .find(|p| p.repo_url == repo_url && p.docs_dir == docs_dir)
            {
                existing.name = name.to_string();
                existing.slug = slugify(name);
                existing.branch = branch.map(str::to_string);
                return Ok(existing.clone());
            }
        }
        self.create_project(name, repo_url, docs_dir, branch)
    }

    pub fn categories(&self) -> Vec<Category> {
        self.read().map(|d| d.categories.clone()).unwrap_or_default()
    }

    pub fn records(&self) -> Vec<ContentRecord> {
        self.read()
            .map(|d| d.records.values().cloned().collect())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreData>, StoreError> {
        self.data
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreData>, StoreError> {
        self.data
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn get_project(&self, project_id: u64) -> Result<Option<Project>, StoreError> {
        Ok(self.read()?.projects.get(&project_id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.read()?.projects.values().cloned().collect())
    }

    async fn update_sync_state(
        &self,
        project_id: u64,
        state: SyncState,
    ) -> Result<(), StoreError> {
        {
            let mut data = self.write()?;
            let project = data
                .projects
                .get_mut(&project_id)
                .ok_or_else(|| StoreError::NotFound {
                    kind: "project",
                    id: project_id.to_string(),
                })?;
            project.sync = state;
        }
        if let Some(path) = &self.snapshot {
            self.save(path)?;
        }
        Ok(())
    }

    async fn find_category_child(
        &self,
        parent_id: u64,
        name: &str,
    ) -> Result<Option<Category>, StoreError> {
        let wanted = name.to_lowercase();
        Ok(self
            .read()?
            .categories
            .iter()
            .find(|c| c.parent_id == parent_id && c.name.to_lowercase() == wanted)
            .cloned())
    }

    async fn create_category(
        &self,
        parent_id: u64,
        name: &str,
        slug: &str,
    ) -> Result<Category, StoreError> {
        let mut data = self.write()?;
        if !data.category_exists(parent_id) {
            return Err(StoreError::NotFound {
                kind: "category",
                id: parent_id.to_string(),
            });
        }
        let category = Category {
            id: data.next_id(),
            name: name.to_string(),
            slug: slug.to_string(),
            parent_id,
        };
        data.categories.push(category.clone());
        Ok(category)
    }

    async fn find_record(
        &self,
        project_id: u64,
        source_file: &str,
    ) -> Result<Option<ContentRecord>, StoreError> {
        let data = self.read()?;
        let subtree = data.subtree(project_id);
        Ok(data
            .records
            .values()
            .find(|r| r.source_file == source_file && subtree.contains(&r.category_id))
            .cloned())
    }

    async fn create_record(&self, record: NewRecord) -> Result<ContentRecord, StoreError> {
        let mut data = self.write()?;
        if !data.category_exists(record.category_id) {
            return Err(StoreError::NotFound {
                kind: "category",
                id: record.category_id.to_string(),
            });
        }
        let id = data.next_id();
        let stored = ContentRecord {
            id,
            title: record.title,
            body: record.body,
            excerpt: record.excerpt,
            category_id: record.category_id,
            permalink: format!("/records/{id}"),
            source_file: record.source_file,
            filesize: record.filesize,
            source_timestamp: record.source_timestamp,
        };
        data.records.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_record(
        &self,
        record_id: u64,
        update: RecordUpdate,
    ) -> Result<ContentRecord, StoreError> {
        let mut data = self.write()?;
        let record = data.record_mut(record_id)?;
        record.title = update.title;
        record.body = update.body;
        record.excerpt = update.excerpt;
        record.filesize = update.filesize;
        record.source_timestamp = update.source_timestamp;
        Ok(record.clone())
    }

    async fn rename_record(&self, record_id: u64, source_file: &str) -> Result<(), StoreError> {
        self.write()?.record_mut(record_id)?.source_file = source_file.to_string();
        Ok(())
    }

    async fn attach_record(&self, record_id: u64, category_id: u64) -> Result<(), StoreError> {
        let mut data = self.write()?;
        if !data.category_exists(category_id) {
            return Err(StoreError::NotFound {
                kind: "category",
                id: category_id.to_string(),
            });
        }
        data.record_mut(record_id)?.category_id = category_id;
        Ok(())
    }

    async fn delete_record(&self, record_id: u64) -> Result<(), StoreError> {
        self.write()?
            .records
            .remove(&record_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "record",
                id: record_id.to_string(),
            })
    }

    async fn subtree_records(&self, project_id: u64) -> Result<Vec<ContentRecord>, StoreError> {
        let data = self.read()?;
        let subtree = data.subtree(project_id);
        Ok(data
            .records
            .values()
            .filter(|r| subtree.contains(&r.category_id))
            .cloned()
            .collect())
    }
}
