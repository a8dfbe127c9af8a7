use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{Duration, Utc};

use docsync_core::config::SyncConfig;
use docsync_core::contract::{
    ContentStore, FileDiff, MockSourceClient, Project, RenamedFile, SyncState, SyncStatus,
    TreeEntry,
};
use docsync_core::error::SourceError;
use docsync_core::store::InMemoryStore;
use docsync_core::synchronise::Synchroniser;

const REPO_URL: &str = "https://github.com/acme/handbook";

fn blob_sha(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(path, body)| (path.to_string(), body.to_string()))
        .collect()
}

/// A scripted repository: `head` is the branch tip, `docs` the files under `docs/`.
fn mock_repo(head: &'static str, docs: BTreeMap<String, String>) -> MockSourceClient {
    let mut source = MockSourceClient::new();
    source
        .expect_latest_commit()
        .returning(move |_, _, _| Ok(head.to_string()));

    let listing = docs.clone();
    source.expect_tree().returning(move |_, _, path, _| {
        Ok(listing
            .iter()
            .map(|(rel, body)| {
                (
                    rel.clone(),
                    TreeEntry {
                        blob_path: format!("{path}/{rel}"),
                        content_hash: blob_sha(body),
                        size: body.len() as u64,
                    },
                )
            })
            .collect())
    });

    source.expect_content().returning(move |_, _, blob_path, _| {
        let rel = blob_path.strip_prefix("docs/").unwrap_or(blob_path);
        docs.get(rel)
            .map(|body| body.clone().into_bytes())
            .ok_or_else(|| SourceError::NotFound(blob_path.to_string()))
    });
    source
}

fn new_project(store: &InMemoryStore) -> Project {
    store
        .create_project("Handbook", REPO_URL, "docs", None)
        .expect("project is created")
}

async fn project_state(store: &InMemoryStore, id: u64) -> SyncState {
    store
        .get_project(id)
        .await
        .expect("store readable")
        .expect("project exists")
        .sync
}

fn sorted(mut paths: Vec<String>) -> Vec<String> {
    paths.sort();
    paths
}

#[tokio::test]
async fn full_sync_builds_hierarchy_and_resolves_links() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let source = mock_repo(
        "sha-1",
        files(&[
            ("intro.md", "# Intro\nHello"),
            ("guides/setup.md", "# Setup\nGo [here](./intro.md)"),
        ]),
    );

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(result.success, "sync should succeed: {:?}", result.error);
    assert_eq!(sorted(result.added.clone()), vec!["guides/setup.md", "intro.md"]);
    assert_eq!(result.new_sha.as_deref(), Some("sha-1"));
    assert!(result.old_sha.is_none());

    let guides = store
        .find_category_child(project.id, "guides")
        .await
        .unwrap()
        .expect("Guides category created under the project");
    assert_eq!(guides.name, "Guides");
    assert_eq!(guides.slug, "guides");

    let intro = store.find_record(project.id, "intro.md").await.unwrap().unwrap();
    let setup = store
        .find_record(project.id, "guides/setup.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(intro.title, "Intro");
    assert_eq!(intro.body, "Hello");
    assert_eq!(intro.category_id, project.id);
    assert_eq!(setup.category_id, guides.id);
    assert_eq!(setup.body, format!("Go [here]({})", intro.permalink));

    let state = project_state(&store, project.id).await;
    assert_eq!(state.status, SyncStatus::Success);
    assert_eq!(state.last_sync_sha.as_deref(), Some("sha-1"));
    assert_eq!(state.files_synced, 2);
    assert!(state.last_sync_time.is_some());
    assert!(state.last_error.is_none());
    assert!(state.sync_started_at.is_none());
}

#[tokio::test]
async fn forward_links_keep_fallback_without_second_pass() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig {
        resolve_forward_links: false,
        ..SyncConfig::default()
    };
    // "guides/setup.md" sorts before "intro.md", so its link is a forward reference.
    let source = mock_repo(
        "sha-1",
        files(&[
            ("intro.md", "# Intro\nHello"),
            ("guides/setup.md", "# Setup\nGo [here](../intro.md)"),
        ]),
    );

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;
    assert!(result.success);

    let setup = store
        .find_record(project.id, "guides/setup.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(setup.body, "Go [here](/docs/intro)");
}

#[tokio::test]
async fn repeated_sync_without_upstream_changes_is_idempotent() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let source = mock_repo(
        "sha-1",
        files(&[("a.md", "# A\nalpha"), ("b/c.md", "# C\ngamma")]),
    );
    let sync = Synchroniser::new(&source, &store, &config);

    let first = sync.sync(project.id, false).await;
    assert!(first.success);
    let before = store.records();

    let second = sync.sync(project.id, false).await;
    assert!(second.success);
    assert!(second.no_changes);
    assert!(second.added.is_empty() && second.updated.is_empty());
    assert_eq!(project_state(&store, project.id).await.files_synced, 2);

    // Forget the commit so the next run re-lists the whole tree.
    sync.reset(project.id).await.unwrap();
    assert_eq!(project_state(&store, project.id).await.status, SyncStatus::Never);

    let third = sync.sync(project.id, false).await;
    assert!(third.success);
    assert!(!third.no_changes);
    assert_eq!(sorted(third.unchanged.clone()), vec!["a.md", "b/c.md"]);
    assert!(third.added.is_empty() && third.updated.is_empty() && third.removed.is_empty());
    assert_eq!(project_state(&store, project.id).await.files_synced, 2);
    assert_eq!(store.records(), before);
}

#[tokio::test]
async fn forced_sync_at_same_commit_rewrites_every_file() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let source = mock_repo("sha-1", files(&[("a.md", "# A\nalpha")]));
    let sync = Synchroniser::new(&source, &store, &config);

    assert!(sync.sync(project.id, false).await.success);
    let forced = sync.sync(project.id, true).await;

    assert!(forced.success);
    assert!(!forced.no_changes);
    assert_eq!(forced.updated, vec!["a.md"]);
}

#[tokio::test]
async fn full_sync_deletes_orphaned_records() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();

    let before = mock_repo("sha-1", files(&[("a.md", "# A\nalpha"), ("b.md", "# B\nbeta")]));
    assert!(Synchroniser::new(&before, &store, &config)
        .sync(project.id, false)
        .await
        .success);
    let b_record = store.find_record(project.id, "b.md").await.unwrap().unwrap();

    let after = mock_repo("sha-2", files(&[("a.md", "# A\nalpha")]));
    let sync = Synchroniser::new(&after, &store, &config);
    sync.reset(project.id).await.unwrap();
    let result = sync.sync(project.id, false).await;

    assert!(result.success);
    assert_eq!(result.removed, vec!["b.md"]);
    assert_eq!(result.unchanged, vec!["a.md"]);
    assert!(store.find_record(project.id, "b.md").await.unwrap().is_none());
    assert!(store.records().iter().all(|r| r.id != b_record.id));
}

#[tokio::test]
async fn incremental_sync_applies_diff() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();

    let initial = mock_repo(
        "sha-1",
        files(&[("keep.md", "# Keep\nv1"), ("drop.md", "# Drop\nbye")]),
    );
    assert!(Synchroniser::new(&initial, &store, &config)
        .sync(project.id, false)
        .await
        .success);

    let mut source = mock_repo(
        "sha-2",
        files(&[("keep.md", "# Keep\nv2"), ("guides/new.md", "# New\nSee [keep](../keep.md)")]),
    );
    source
        .expect_diff()
        .withf(|_, _, base, head, path| base == "sha-1" && head == "sha-2" && path == "docs")
        .times(1)
        .returning(|_, _, _, _, _| {
            Ok(FileDiff {
                added: vec!["guides/new.md".into()],
                modified: vec!["keep.md".into()],
                removed: vec!["drop.md".into(), "never-synced.md".into()],
                ..FileDiff::default()
            })
        });

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(result.success, "incremental sync failed: {:?}", result.error);
    assert_eq!(result.old_sha.as_deref(), Some("sha-1"));
    assert_eq!(result.added, vec!["guides/new.md"]);
    assert_eq!(result.updated, vec!["keep.md"]);
    assert_eq!(result.removed, vec!["drop.md"]);

    let keep = store.find_record(project.id, "keep.md").await.unwrap().unwrap();
    assert_eq!(keep.body, "v2");
    let new = store.find_record(project.id, "guides/new.md").await.unwrap().unwrap();
    assert_eq!(new.body, format!("See [keep]({})", keep.permalink));
    assert!(store.find_record(project.id, "drop.md").await.unwrap().is_none());

    let state = project_state(&store, project.id).await;
    assert_eq!(state.last_sync_sha.as_deref(), Some("sha-2"));
    assert_eq!(state.files_synced, 2);
}

#[tokio::test]
async fn unusable_compare_falls_back_to_full_sync() {
    let failures = [
        SourceError::NotFound("compare sha-1...sha-2".into()),
        SourceError::Truncated("compare sha-1...sha-2 lists 300 files".into()),
    ];
    for failure in failures {
        let store = InMemoryStore::new();
        let project = new_project(&store);
        let config = SyncConfig::default();

        let initial = mock_repo("sha-1", files(&[("a.md", "# A\nv1"), ("gone.md", "# Gone\nx")]));
        assert!(Synchroniser::new(&initial, &store, &config)
            .sync(project.id, false)
            .await
            .success);

        let mut source = mock_repo("sha-2", files(&[("a.md", "# A\nv2"), ("b.md", "# B\nnew")]));
        let err = failure.clone();
        source
            .expect_diff()
            .times(1)
            .returning(move |_, _, _, _, _| Err(err.clone()));

        let result = Synchroniser::new(&source, &store, &config)
            .sync(project.id, false)
            .await;

        assert!(result.success, "fallback after {failure:?} failed: {:?}", result.error);
        assert_eq!(result.added, vec!["b.md"]);
        assert_eq!(result.updated, vec!["a.md"]);
        assert_eq!(result.removed, vec!["gone.md"]);
        assert_eq!(
            project_state(&store, project.id).await.last_sync_sha.as_deref(),
            Some("sha-2")
        );
    }
}

#[tokio::test]
async fn truncated_tree_fails_without_deleting() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();

    let initial = mock_repo("sha-1", files(&[("a.md", "# A\nalpha")]));
    assert!(Synchroniser::new(&initial, &store, &config)
        .sync(project.id, false)
        .await
        .success);

    let mut source = MockSourceClient::new();
    source
        .expect_latest_commit()
        .returning(|_, _, _| Ok("sha-2".to_string()));
    source
        .expect_tree()
        .returning(|_, _, _, _| Err(SourceError::Truncated("tree too large".into())));
    let sync = Synchroniser::new(&source, &store, &config);
    sync.reset(project.id).await.unwrap();

    let result = sync.sync(project.id, false).await;

    assert!(!result.success);
    assert!(result.removed.is_empty());
    assert!(result.error.unwrap().contains("tree too large"));
    assert!(store.find_record(project.id, "a.md").await.unwrap().is_some());
}

#[tokio::test]
async fn incremental_rename_keeps_record_identity() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let body = "# Old Name\nSame content";

    let initial = mock_repo("sha-1", files(&[("x/old.md", body)]));
    assert!(Synchroniser::new(&initial, &store, &config)
        .sync(project.id, false)
        .await
        .success);
    let original = store.find_record(project.id, "x/old.md").await.unwrap().unwrap();

    let mut source = mock_repo("sha-2", files(&[("x/new.md", body)]));
    source.expect_diff().returning(|_, _, _, _, _| {
        Ok(FileDiff {
            renamed: vec![RenamedFile {
                previous: "x/old.md".into(),
                new: "x/new.md".into(),
            }],
            ..FileDiff::default()
        })
    });

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(result.success, "rename sync failed: {:?}", result.error);
    assert_eq!(result.renamed, vec!["x/new.md"]);
    assert!(result.added.is_empty());
    assert!(result.removed.is_empty());
    assert!(result.updated.is_empty());

    let renamed = store.find_record(project.id, "x/new.md").await.unwrap().unwrap();
    assert_eq!(renamed.id, original.id);
    assert_eq!(renamed.body, "Same content");
    assert_eq!(renamed.category_id, original.category_id);
    assert!(store.find_record(project.id, "x/old.md").await.unwrap().is_none());
}

#[tokio::test]
async fn rename_across_directories_moves_category() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let body = "# Page\ntext";

    let initial = mock_repo("sha-1", files(&[("drafts/page.md", body)]));
    assert!(Synchroniser::new(&initial, &store, &config)
        .sync(project.id, false)
        .await
        .success);

    let mut source = mock_repo("sha-2", files(&[("published/page.md", body)]));
    source.expect_diff().returning(|_, _, _, _, _| {
        Ok(FileDiff {
            renamed: vec![RenamedFile {
                previous: "drafts/page.md".into(),
                new: "published/page.md".into(),
            }],
            ..FileDiff::default()
        })
    });
    assert!(Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await
        .success);

    let published = store
        .find_category_child(project.id, "Published")
        .await
        .unwrap()
        .expect("category for the new directory");
    let record = store
        .find_record(project.id, "published/page.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.category_id, published.id);
}

#[tokio::test]
async fn missing_title_fails_one_file_but_not_the_batch() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let source = mock_repo(
        "sha-1",
        files(&[("a.md", "no header here"), ("b.md", "# B\nfine")]),
    );

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.added, vec!["b.md"]);
    let error = result.error.expect("error message recorded");
    assert!(error.contains("a.md"), "unexpected error: {error}");

    let state = project_state(&store, project.id).await;
    assert_eq!(state.status, SyncStatus::Failed);
    assert_eq!(state.last_error.as_deref(), Some(error.as_str()));
    assert!(state.last_sync_sha.is_none(), "failed sync must not advance the SHA");
    assert!(store.find_record(project.id, "b.md").await.unwrap().is_some());
}

#[tokio::test]
async fn content_fetch_failure_stops_the_run_without_deleting() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();

    let initial = mock_repo("sha-1", files(&[("a.md", "# A\nalpha"), ("z.md", "# Z\nzeta")]));
    assert!(Synchroniser::new(&initial, &store, &config)
        .sync(project.id, false)
        .await
        .success);

    let mut source = MockSourceClient::new();
    source
        .expect_latest_commit()
        .returning(|_, _, _| Ok("sha-2".to_string()));
    source.expect_tree().returning(|_, _, _, _| {
        Ok(BTreeMap::from([(
            "a.md".to_string(),
            TreeEntry {
                blob_path: "docs/a.md".into(),
                content_hash: "new".into(),
                size: 3,
            },
        )]))
    });
    source
        .expect_content()
        .times(1)
        .returning(|_, _, _, _| Err(SourceError::Transport("connection reset".into())));

    let sync = Synchroniser::new(&source, &store, &config);
    sync.reset(project.id).await.unwrap();
    let result = sync.sync(project.id, false).await;

    assert!(!result.success);
    assert!(result.removed.is_empty(), "aborted run must not delete orphans");
    assert!(result.error.unwrap().contains("connection reset"));
    assert!(store.find_record(project.id, "z.md").await.unwrap().is_some());
    assert_eq!(project_state(&store, project.id).await.status, SyncStatus::Failed);
}

#[tokio::test]
async fn vanished_blob_fails_only_its_file() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    // The listing still mentions a.md, but fetching it 404s.
    let mut source = MockSourceClient::new();
    source
        .expect_latest_commit()
        .returning(|_, _, _| Ok("sha-1".to_string()));
    source.expect_tree().returning(|_, _, _, _| {
        Ok(BTreeMap::from([
            (
                "a.md".to_string(),
                TreeEntry {
                    blob_path: "docs/a.md".into(),
                    content_hash: "gone".into(),
                    size: 1,
                },
            ),
            (
                "b.md".to_string(),
                TreeEntry {
                    blob_path: "docs/b.md".into(),
                    content_hash: blob_sha("# B\nbeta"),
                    size: 8,
                },
            ),
        ]))
    });
    source.expect_content().returning(|_, _, blob_path, _| {
        if blob_path == "docs/b.md" {
            Ok(b"# B\nbeta".to_vec())
        } else {
            Err(SourceError::NotFound(blob_path.to_string()))
        }
    });

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.added, vec!["b.md"]);
    assert!(result.error.unwrap().starts_with("a.md: not found"));
}

#[tokio::test]
async fn unreachable_repository_marks_project_failed() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let mut source = MockSourceClient::new();
    source.expect_latest_commit().returning(|_, _, _| {
        Err(SourceError::Unauthorized {
            status: 401,
            message: "Bad credentials".into(),
        })
    });

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(!result.success);
    assert!(result.new_sha.is_none());
    let state = project_state(&store, project.id).await;
    assert_eq!(state.status, SyncStatus::Failed);
    assert!(state.last_error.unwrap().contains("Bad credentials"));
}

#[tokio::test]
async fn empty_tree_is_a_failure() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let source = mock_repo("sha-1", BTreeMap::new());

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("no documentation files found"));
}

#[tokio::test]
async fn malformed_repo_url_fails_before_any_request() {
    let store = InMemoryStore::new();
    let project = store
        .create_project("Broken", "not a repository", "docs", None)
        .unwrap();
    let config = SyncConfig::default();
    // No expectations: any call on the source would panic.
    let source = MockSourceClient::new();

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("not a repository"));
    assert_eq!(project_state(&store, project.id).await.status, SyncStatus::Failed);
}

#[tokio::test]
async fn unknown_project_is_reported() {
    let store = InMemoryStore::new();
    let config = SyncConfig::default();
    let source = MockSourceClient::new();

    let result = Synchroniser::new(&source, &store, &config).sync(42, false).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("project 42 does not exist"));
}

#[tokio::test]
async fn fresh_lock_refuses_concurrent_sync() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    let held = SyncState {
        status: SyncStatus::Syncing,
        sync_started_at: Some(Utc::now() - Duration::seconds(30)),
        ..SyncState::default()
    };
    store.update_sync_state(project.id, held.clone()).await.unwrap();
    let source = MockSourceClient::new();

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("already in progress"));
    assert_eq!(project_state(&store, project.id).await, held);
}

#[tokio::test]
async fn stale_lock_is_taken_over() {
    let store = InMemoryStore::new();
    let project = new_project(&store);
    let config = SyncConfig::default();
    store
        .update_sync_state(
            project.id,
            SyncState {
                status: SyncStatus::Syncing,
                sync_started_at: Some(Utc::now() - Duration::hours(2)),
                ..SyncState::default()
            },
        )
        .await
        .unwrap();
    let source = mock_repo("sha-1", files(&[("a.md", "# A\nalpha")]));

    let result = Synchroniser::new(&source, &store, &config)
        .sync(project.id, false)
        .await;

    assert!(result.success);
    assert_eq!(project_state(&store, project.id).await.status, SyncStatus::Success);
}

#[tokio::test]
async fn sync_all_continues_after_a_failing_project() {
    let store = InMemoryStore::new();
    let broken = store
        .create_project("Broken", "nope", "docs", None)
        .unwrap();
    let good = new_project(&store);
    let config = SyncConfig::default();
    let source = mock_repo("sha-1", files(&[("a.md", "# A\nalpha")]));

    let results = Synchroniser::new(&source, &store, &config)
        .sync_all(false)
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    let by_id = |id| results.iter().find(|r| r.project_id == id).unwrap();
    assert!(!by_id(broken.id).success);
    assert!(by_id(good.id).success);
    assert_eq!(by_id(good.id).added, vec!["a.md"]);
}
