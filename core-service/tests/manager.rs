//! End-to-end scenarios against real temporary directories.

use async_trait::async_trait;
use core_extract::FilePlugin;
use core_index::CachePolicy;
use core_runtime::events::MetaEvent;
use core_service::{ConflictMode, FileMetaManager, ManagerConfig, MetaError};
use core_store::{JsonBackend, JsonMap, SqliteBackend};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

async fn write_file(path: &Path, contents: &str) {
    tokio::fs::write(path, contents).await.unwrap();
}

async fn manager() -> FileMetaManager {
    FileMetaManager::bootstrap(ManagerConfig::builder().build().unwrap())
        .await
        .unwrap()
}

async fn manager_indexing(fields: &[&str]) -> FileMetaManager {
    let mut builder = ManagerConfig::builder();
    for field in fields {
        builder = builder.index(*field);
    }
    FileMetaManager::bootstrap(builder.build().unwrap())
        .await
        .unwrap()
}

fn canonical(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

struct PngPlugin;

#[async_trait]
impl FilePlugin for PngPlugin {
    fn name(&self) -> &str {
        "png"
    }

    fn supports(&self, path: &str) -> bool {
        path.ends_with(".png")
    }

    async fn extract(&self, _path: &str) -> core_extract::Result<JsonMap> {
        let Value::Object(map) = json!({"format": "PNG"}) else {
            unreachable!()
        };
        Ok(map)
    }
}

#[tokio::test]
async fn add_then_search_by_tag() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.png");
    write_file(file.as_ref(), "pixels").await;

    let manager = manager_indexing(&["user.tags"]).await;
    manager
        .add_file(&file, json!({"tags": ["design", "ui"], "project": "w"}))
        .await
        .unwrap();

    let hits = manager
        .search_collect(json!({"user.tags": {"$contains": "design"}}))
        .await
        .unwrap();
    assert_eq!(hits, vec![file]);
}

#[tokio::test]
async fn update_shallow_merges_user_metadata() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.png");
    write_file(file.as_ref(), "pixels").await;

    let manager = manager().await;
    manager
        .add_file(&file, json!({"tags": ["design", "ui"], "project": "w"}))
        .await
        .unwrap();
    manager
        .update_metadata(&file, json!({"status": "approved"}))
        .await
        .unwrap();

    let record = manager.get_metadata(&file).await.unwrap();
    assert_eq!(
        Value::Object(record.user),
        json!({"tags": ["design", "ui"], "project": "w", "status": "approved"})
    );
}

#[tokio::test]
async fn plugins_populate_the_plugin_tier() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "b.png");
    write_file(file.as_ref(), "pixels").await;

    let manager = manager().await;
    manager.register_plugin(Arc::new(PngPlugin));
    manager.add_file(&file, json!({})).await.unwrap();

    let record = manager.get_metadata(&file).await.unwrap();
    assert_eq!(Value::Object(record.plugin), json!({"format": "PNG"}));
}

#[tokio::test]
async fn sync_removes_records_for_deleted_files() {
    let dir = tempdir().unwrap();
    let x = canonical(&dir, "x.txt");
    let y = canonical(&dir, "y.txt");
    write_file(x.as_ref(), "x").await;
    write_file(y.as_ref(), "y").await;

    let manager = manager().await;
    manager
        .add_file(&x, json!({"project": "alpha"}))
        .await
        .unwrap();
    manager
        .add_file(&y, json!({"project": "alpha"}))
        .await
        .unwrap();

    tokio::fs::remove_file(&x).await.unwrap();
    let report = manager.sync().await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.removed, 1);

    let err = manager.get_metadata(&x).await.unwrap_err();
    assert!(matches!(err, MetaError::FileAccess(_)));
    manager.get_metadata(&y).await.unwrap();
}

#[tokio::test]
async fn replace_drops_unspecified_user_keys() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "r.xlsx");
    write_file(file.as_ref(), "cells").await;

    let manager = manager().await;
    manager
        .add_file(&file, json!({"department": "fin", "quarter": "Q2"}))
        .await
        .unwrap();
    manager
        .replace_metadata(&file, json!({"archived": true}))
        .await
        .unwrap();

    let record = manager.get_metadata(&file).await.unwrap();
    assert_eq!(Value::Object(record.user), json!({"archived": true}));
}

#[tokio::test]
async fn export_import_round_trips_records() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.png");
    write_file(file.as_ref(), "pixels").await;

    let source = manager_indexing(&["user.tags"]).await;
    source
        .add_file(&file, json!({"tags": ["design", "ui"], "project": "w"}))
        .await
        .unwrap();
    source
        .update_metadata(&file, json!({"status": "approved"}))
        .await
        .unwrap();
    let original = source.get_metadata(&file).await.unwrap();

    let document = source.export_document().await.unwrap();
    assert_eq!(document.indexes, vec!["user.tags".to_string()]);

    let target = manager().await;
    let count = target
        .import_document(document, ConflictMode::Overwrite)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(target.get_metadata(&file).await.unwrap(), original);

    // The index hint was honored on restore.
    let hits = target
        .search_collect(json!({"user.tags": {"$contains": "design"}}))
        .await
        .unwrap();
    assert_eq!(hits, vec![file]);
}

#[tokio::test]
async fn export_import_via_files() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.txt");
    write_file(file.as_ref(), "text").await;
    let dump = dir.path().join("dump.json");

    let source = manager().await;
    source.add_file(&file, json!({"kept": true})).await.unwrap();
    assert_eq!(source.export_to_path(&dump).await.unwrap(), 1);

    let target = manager().await;
    assert_eq!(
        target
            .import_from_path(&dump, ConflictMode::Error)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        target.get_metadata(&file).await.unwrap().field("kept"),
        Some(json!(true))
    );
}

#[tokio::test]
async fn duplicate_add_fails_and_preserves_the_original() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.txt");
    write_file(file.as_ref(), "text").await;

    let manager = manager().await;
    manager.add_file(&file, json!({"v": 1})).await.unwrap();

    let err = manager.add_file(&file, json!({"v": 2})).await.unwrap_err();
    assert!(matches!(err, MetaError::DuplicateRecord(_)));
    assert_eq!(
        manager.get_metadata(&file).await.unwrap().field("v"),
        Some(json!(1))
    );

    // Replacement mode is explicit.
    manager.upsert_file(&file, json!({"v": 2})).await.unwrap();
    assert_eq!(
        manager.get_metadata(&file).await.unwrap().field("v"),
        Some(json!(2))
    );
}

#[tokio::test]
async fn transactions_group_operations_atomically() {
    let dir = tempdir().unwrap();
    let a = canonical(&dir, "a.txt");
    let b = canonical(&dir, "b.txt");
    write_file(a.as_ref(), "a").await;
    write_file(b.as_ref(), "b").await;

    let manager = manager().await;

    let mut txn = manager.transaction().await.unwrap();
    txn.add_file(&a, json!({"batch": 1})).await.unwrap();
    txn.add_file(&b, json!({"batch": 1})).await.unwrap();
    txn.commit().await.unwrap();
    manager.get_metadata(&a).await.unwrap();
    manager.get_metadata(&b).await.unwrap();

    let mut txn = manager.transaction().await.unwrap();
    txn.update_metadata(&a, json!({"batch": 2})).await.unwrap();
    txn.delete_metadata(&b).await.unwrap();
    txn.rollback().await.unwrap();

    assert_eq!(
        manager.get_metadata(&a).await.unwrap().field("batch"),
        Some(json!(1))
    );
    manager.get_metadata(&b).await.unwrap();
}

#[tokio::test]
async fn listeners_observe_committed_mutations_in_order() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.txt");
    write_file(file.as_ref(), "text").await;

    let manager = manager().await;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        manager.add_listener(move |event| {
            let tag = match event {
                MetaEvent::FileAdded { .. } => "added",
                MetaEvent::FileRemoved { .. } => "removed",
                MetaEvent::MetadataChanged { .. } => "changed",
                MetaEvent::SyncComplete { .. } => "sync",
            };
            seen.lock().unwrap().push(tag.to_string());
        });
    }

    manager.add_file(&file, json!({})).await.unwrap();
    manager
        .update_metadata(&file, json!({"k": 1}))
        .await
        .unwrap();
    manager.delete_metadata(&file).await.unwrap();
    manager.sync().await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["added", "changed", "removed", "sync"]
    );
}

#[tokio::test]
async fn search_is_deterministic_and_insertion_ordered() {
    let dir = tempdir().unwrap();
    let manager = manager().await;
    let mut expected = Vec::new();
    for name in ["c.txt", "a.txt", "b.txt"] {
        let path = canonical(&dir, name);
        write_file(path.as_ref(), name).await;
        manager.add_file(&path, json!({"kind": "note"})).await.unwrap();
        expected.push(path);
    }

    let first = manager
        .search_collect(json!({"kind": "note"}))
        .await
        .unwrap();
    let second = manager
        .search_collect(json!({"kind": "note"}))
        .await
        .unwrap();
    assert_eq!(first, expected);
    assert_eq!(first, second);
}

#[tokio::test]
async fn sync_reprobes_modified_files_preserving_user() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.txt");
    write_file(file.as_ref(), "v1").await;

    let manager = manager().await;
    manager.add_file(&file, json!({"pinned": true})).await.unwrap();
    let before = manager.get_metadata(&file).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    write_file(file.as_ref(), "version two, longer").await;

    let report = manager.sync().await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.removed, 0);

    let after = manager.get_metadata(&file).await.unwrap();
    assert_eq!(after.field("pinned"), Some(json!(true)));
    assert!(after.system.size > before.system.size);

    // A quiescent filesystem syncs to all zeroes.
    let report = manager.sync().await.unwrap();
    assert_eq!((report.added, report.updated, report.removed), (0, 0, 0));
}

#[tokio::test]
async fn sync_discovers_files_under_configured_roots() {
    let dir = tempdir().unwrap();
    let nested = dir.path().join("sub");
    tokio::fs::create_dir_all(&nested).await.unwrap();
    write_file(&nested.join("found.txt"), "new").await;
    write_file(&nested.join("skipped.bin"), "new").await;

    let manager = FileMetaManager::bootstrap(
        ManagerConfig::builder()
            .sync_root(dir.path())
            .include_extensions(["txt"])
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let report = manager.sync().await.unwrap();
    assert_eq!(report.added, 1);

    let found = canonical(&dir, "sub/found.txt");
    manager.get_metadata(&found).await.unwrap();
    let err = manager
        .get_metadata(&canonical(&dir, "sub/skipped.bin"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::FileAccess(_)));
}

#[tokio::test]
async fn cleanup_orphaned_counts_removed_records() {
    let dir = tempdir().unwrap();
    let keep = canonical(&dir, "keep.txt");
    let gone = canonical(&dir, "gone.txt");
    write_file(keep.as_ref(), "k").await;
    write_file(gone.as_ref(), "g").await;

    let manager = manager().await;
    manager.add_file(&keep, json!({})).await.unwrap();
    manager.add_file(&gone, json!({})).await.unwrap();
    tokio::fs::remove_file(&gone).await.unwrap();

    assert_eq!(manager.cleanup_orphaned().await.unwrap(), 1);
    manager.get_metadata(&keep).await.unwrap();
}

#[tokio::test]
async fn refresh_reruns_probe_and_plugins() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "late.png");
    write_file(file.as_ref(), "pixels").await;

    let manager = manager().await;
    manager.add_file(&file, json!({"kept": 1})).await.unwrap();
    assert!(manager.get_metadata(&file).await.unwrap().plugin.is_empty());

    // Plugin registered after the fact only applies on refresh.
    manager.register_plugin(Arc::new(PngPlugin));
    let record = manager.refresh(&file).await.unwrap();
    assert_eq!(record.field("plugin.format"), Some(json!("PNG")));
    assert_eq!(record.field("kept"), Some(json!(1)));
}

#[tokio::test]
async fn json_backend_survives_a_restart() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    tokio::fs::create_dir_all(&data).await.unwrap();
    let file = data.join("a.txt");
    write_file(&file, "text").await;
    let store = dir.path().join("store").join("meta.json");

    {
        let backend = Arc::new(JsonBackend::open(&store).await.unwrap());
        let manager = FileMetaManager::bootstrap(
            ManagerConfig::builder().storage(backend).build().unwrap(),
        )
        .await
        .unwrap();
        manager
            .add_file(file.to_str().unwrap(), json!({"persisted": true}))
            .await
            .unwrap();
        manager.shutdown().await.unwrap();
    }

    let backend = Arc::new(JsonBackend::open(&store).await.unwrap());
    let manager = FileMetaManager::bootstrap(
        ManagerConfig::builder().storage(backend).build().unwrap(),
    )
    .await
    .unwrap();
    let record = manager.get_metadata(file.to_str().unwrap()).await.unwrap();
    assert_eq!(record.field("persisted"), Some(json!(true)));
}

#[tokio::test]
async fn sqlite_backend_survives_a_restart() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    tokio::fs::create_dir_all(&data).await.unwrap();
    let file = data.join("a.txt");
    write_file(&file, "text").await;
    let db = dir.path().join("meta.db");

    {
        let backend = Arc::new(SqliteBackend::connect(&db).await.unwrap());
        let manager = FileMetaManager::bootstrap(
            ManagerConfig::builder().storage(backend).build().unwrap(),
        )
        .await
        .unwrap();
        manager
            .add_file(file.to_str().unwrap(), json!({"engine": "sqlite"}))
            .await
            .unwrap();
        manager.shutdown().await.unwrap();
    }

    let backend = Arc::new(SqliteBackend::connect(&db).await.unwrap());
    let manager = FileMetaManager::bootstrap(
        ManagerConfig::builder().storage(backend).build().unwrap(),
    )
    .await
    .unwrap();
    let hits = manager
        .search_collect(json!({"engine": "sqlite"}))
        .await
        .unwrap();
    assert_eq!(hits, vec![file.to_str().unwrap().to_string()]);
}

#[tokio::test]
async fn evicted_records_reload_transparently() {
    let dir = tempdir().unwrap();
    let manager = FileMetaManager::bootstrap(
        ManagerConfig::builder()
            .max_cache_size(1)
            .cache_policy(CachePolicy::Lru)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let mut paths = Vec::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        let path = canonical(&dir, name);
        write_file(path.as_ref(), name).await;
        manager.add_file(&path, json!({"name": name})).await.unwrap();
        paths.push(path);
    }

    for (path, name) in paths.iter().zip(["a.txt", "b.txt", "c.txt"]) {
        let record = manager.get_metadata(path).await.unwrap();
        assert_eq!(record.field("name"), Some(json!(name)));
    }
}

#[tokio::test]
async fn create_index_at_runtime_backfills() {
    let dir = tempdir().unwrap();
    let manager = manager().await;
    for (name, owner) in [("a.txt", "alice"), ("b.txt", "bob")] {
        let path = canonical(&dir, name);
        write_file(path.as_ref(), name).await;
        manager.add_file(&path, json!({"owner": owner})).await.unwrap();
    }

    manager.create_index("user.owner").await.unwrap();
    let hits = manager
        .search_collect(json!({"user.owner": "alice"}))
        .await
        .unwrap();
    assert_eq!(hits, vec![canonical(&dir, "a.txt")]);
}

#[tokio::test]
async fn query_boundary_semantics() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.txt");
    write_file(file.as_ref(), "text").await;

    let manager = manager().await;
    manager
        .add_file(&file, json!({"size_label": "big", "tags": ["one"]}))
        .await
        .unwrap();

    // Numeric comparison against a string field is a no-match, not an error.
    assert!(manager
        .search_collect(json!({"size_label": {"$gt": 5}}))
        .await
        .unwrap()
        .is_empty());

    // $exists:false matches records lacking the field entirely.
    assert_eq!(
        manager
            .search_collect(json!({"missing": {"$exists": false}}))
            .await
            .unwrap(),
        vec![file.clone()]
    );

    // System fields are queryable alongside user fields.
    assert_eq!(
        manager
            .search_collect(json!({"system.extension": "txt", "tags": "one"}))
            .await
            .unwrap(),
        vec![file]
    );

    // Malformed queries surface eagerly.
    match manager.search(json!({"a": {"$nope": 1}})).await {
        Err(MetaError::Query(_)) => {}
        Err(other) => panic!("expected a query error, got {other}"),
        Ok(_) => panic!("malformed query was accepted"),
    }
}

#[tokio::test]
async fn idempotent_mutations_are_no_ops() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.txt");
    write_file(file.as_ref(), "text").await;

    let manager = manager().await;
    manager
        .add_file(&file, json!({"stable": true}))
        .await
        .unwrap();
    let before = manager.get_metadata(&file).await.unwrap();

    manager.update_metadata(&file, json!({})).await.unwrap();
    assert_eq!(manager.get_metadata(&file).await.unwrap(), before);

    manager
        .replace_metadata(&file, Value::Object(before.user.clone()))
        .await
        .unwrap();
    assert_eq!(manager.get_metadata(&file).await.unwrap(), before);
}

#[tokio::test]
async fn import_conflict_modes() {
    let dir = tempdir().unwrap();
    let file = canonical(&dir, "a.txt");
    write_file(file.as_ref(), "text").await;

    let manager = manager().await;
    manager.add_file(&file, json!({"v": "original"})).await.unwrap();

    let mut newer = manager.export_document().await.unwrap();
    {
        let record = newer.records.get_mut(&file).unwrap();
        record.user.insert("v".to_string(), json!("newer"));
        record.system.modified += 100.0;
    }
    let mut older = newer.clone();
    if let Some(record) = older.records.get_mut(&file) {
        record.user.insert("v".to_string(), json!("older"));
        record.system.modified -= 1000.0;
    }

    assert!(matches!(
        manager
            .import_document(newer.clone(), ConflictMode::Error)
            .await
            .unwrap_err(),
        MetaError::DuplicateRecord(_)
    ));

    assert_eq!(
        manager
            .import_document(newer.clone(), ConflictMode::Keep)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        manager.get_metadata(&file).await.unwrap().field("v"),
        Some(json!("original"))
    );

    assert_eq!(
        manager
            .import_document(older, ConflictMode::Newer)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        manager
            .import_document(newer, ConflictMode::Newer)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        manager.get_metadata(&file).await.unwrap().field("v"),
        Some(json!("newer"))
    );
}

#[tokio::test]
async fn lazy_search_streams_one_item_at_a_time() {
    use futures::StreamExt;

    let dir = tempdir().unwrap();
    let manager = manager().await;
    for name in ["a.txt", "b.txt"] {
        let path = canonical(&dir, name);
        write_file(path.as_ref(), name).await;
        manager.add_file(&path, json!({})).await.unwrap();
    }

    let mut stream = manager.search(json!({})).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, canonical(&dir, "a.txt"));
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second, canonical(&dir, "b.txt"));
    assert!(stream.next().await.is_none());
}
