//! Integration tests for the crumbs-store crate.
//!
//! These tests drive the full attach → mutate → detach lifecycle against a
//! real data directory on disk (via tempfile) and check what lands in the
//! flat files under each sync strategy.

use std::path::Path;
use std::time::Duration;

use crumbs_store::{
    Backend, Collection, Config, Crumb, Entity, Link, LinkType, Property, Stash,
    StashHistoryEntry, StoreError, SyncConfig, Table, TableName, Trail, ValueType,
    builtin_names, jsonl,
};
use serde_json::{Value, json};

fn lines(dir: &Path, collection: Collection) -> Vec<Value> {
    jsonl::read_all(&dir.join(collection.file_name())).unwrap()
}

async fn attached(dir: &Path, sync: SyncConfig) -> Backend {
    let backend = Backend::new();
    backend
        .attach(&Config::new(dir).with_sync(sync))
        .await
        .unwrap();
    backend
}

// ═══════════════════════════════════════════════════════════════════════
//  Accessor contract through the registry
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn registry_set_get_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::immediate()).await;

    let crumbs = backend.table(TableName::Crumbs).await.unwrap();
    let stored = crumbs.set("", Crumb::new("first").into()).await.unwrap();
    let id = stored.id().to_string();
    assert_eq!(crumbs.get(&id).await.unwrap(), stored);

    crumbs.delete(&id).await.unwrap();
    assert!(matches!(
        crumbs.get(&id).await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(crumbs.fetch(None).await.unwrap().is_empty());

    let trails = backend.table_by_name("trails").await.unwrap();
    assert!(trails.fetch(None).await.unwrap().is_empty());

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn new_crumbs_carry_builtin_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::immediate()).await;

    let properties = backend.properties().await.unwrap();
    let defined: Vec<Property> = properties
        .fetch(None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| Property::try_from(e).unwrap())
        .collect();
    assert_eq!(defined.len(), builtin_names().count());

    let crumbs = backend.crumbs().await.unwrap();
    let crumb = Crumb::try_from(crumbs.set("", Crumb::new("defaults").into()).await.unwrap())
        .unwrap();
    for property in &defined {
        assert_eq!(
            crumb.properties.get(&property.id),
            Some(&property.value_type.default_value()),
            "default for {}",
            property.name
        );
    }

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn property_definition_backfills_without_overwriting() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    let crumbs = backend.crumbs().await.unwrap();
    let properties = backend.properties().await.unwrap();

    // A value staged under an id that is not defined yet.
    let staged = Crumb::try_from(
        crumbs
            .set(
                "",
                Crumb::new("staged").with_property("points-id", json!(13)).into(),
            )
            .await
            .unwrap(),
    )
    .unwrap();
    let plain = Crumb::try_from(crumbs.set("", Crumb::new("plain").into()).await.unwrap())
        .unwrap();

    properties
        .set("points-id", Property::new("points", ValueType::Integer).into())
        .await
        .unwrap();

    let staged = Crumb::try_from(crumbs.get(&staged.id).await.unwrap()).unwrap();
    let plain = Crumb::try_from(crumbs.get(&plain.id).await.unwrap()).unwrap();
    assert_eq!(staged.properties["points-id"], json!(13));
    assert_eq!(plain.properties["points-id"], json!(0));

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn duplicate_link_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    let links = backend.links().await.unwrap();

    links
        .set("", Link::new(LinkType::BelongsTo, "c1", "t1").into())
        .await
        .unwrap();
    let err = links
        .set("", Link::new(LinkType::BelongsTo, "c1", "t1").into())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateName { .. }));
    assert_eq!(lines(dir.path(), Collection::Links).len(), 1);

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn held_lock_blocks_delete_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    let stashes = backend.stashes().await.unwrap();

    let mut lock = Stash::try_from(stashes.set("", Stash::lock("deploy").into()).await.unwrap())
        .unwrap();
    lock.acquire("worker-1").unwrap();
    let id = lock.id.clone();
    let mut lock = Stash::try_from(stashes.set(&id, lock.into()).await.unwrap()).unwrap();

    assert!(matches!(
        stashes.delete(&id).await,
        Err(StoreError::LockHeld { .. })
    ));

    lock.release("worker-1").unwrap();
    stashes.set(&id, lock.into()).await.unwrap();
    stashes.delete(&id).await.unwrap();

    assert!(lines(dir.path(), Collection::Stashes).is_empty());
    assert!(lines(dir.path(), Collection::StashHistory).is_empty());
    backend.detach().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Sync strategies
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn immediate_writes_before_set_returns() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    let trails = backend.trails().await.unwrap();

    trails.set("", Trail::new().into()).await.unwrap();
    assert_eq!(lines(dir.path(), Collection::Trails).len(), 1);
    assert_eq!(backend.pending_writes().await.unwrap(), 0);

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn on_close_defers_until_detach() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::on_close()).await;
    let trails = backend.trails().await.unwrap();

    for _ in 0..3 {
        trails.set("", Trail::new().into()).await.unwrap();
    }
    assert!(lines(dir.path(), Collection::Trails).is_empty());
    assert_eq!(backend.pending_writes().await.unwrap(), 3);

    backend.detach().await.unwrap();
    assert_eq!(lines(dir.path(), Collection::Trails).len(), 3);
}

#[tokio::test]
async fn batch_flushes_at_size_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::batch(3, 0)).await;
    let trails = backend.trails().await.unwrap();

    for _ in 0..2 {
        trails.set("", Trail::new().into()).await.unwrap();
    }
    assert!(lines(dir.path(), Collection::Trails).is_empty());

    trails.set("", Trail::new().into()).await.unwrap();
    assert_eq!(lines(dir.path(), Collection::Trails).len(), 3);
    assert_eq!(backend.pending_writes().await.unwrap(), 0);

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn batch_timer_flushes_within_interval() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::batch(100, 1)).await;
    let trails = backend.trails().await.unwrap();

    trails.set("", Trail::new().into()).await.unwrap();
    assert!(lines(dir.path(), Collection::Trails).is_empty());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(lines(dir.path(), Collection::Trails).len(), 1);

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn explicit_flush_while_attached() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::on_close()).await;
    let trails = backend.trails().await.unwrap();

    trails.set("", Trail::new().into()).await.unwrap();
    backend.flush().await.unwrap();
    assert_eq!(lines(dir.path(), Collection::Trails).len(), 1);

    backend.detach().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reattach_restores_everything_without_duplicating_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let (crumb_id, stash_id) = {
        let backend = attached(dir.path(), SyncConfig::on_close()).await;
        let crumbs = backend.crumbs().await.unwrap();
        let stashes = backend.stashes().await.unwrap();

        let crumb = crumbs.set("", Crumb::new("persist me").into()).await.unwrap();
        let stash = stashes.set("", Stash::counter("runs").into()).await.unwrap();
        backend.detach().await.unwrap();
        (crumb.id().to_string(), stash.id().to_string())
    };

    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    let crumbs = backend.crumbs().await.unwrap();
    let crumb = Crumb::try_from(crumbs.get(&crumb_id).await.unwrap()).unwrap();
    assert_eq!(crumb.name, "persist me");
    assert_eq!(crumb.properties.len(), builtin_names().count());

    let properties = backend.properties().await.unwrap();
    assert_eq!(
        properties.fetch(None).await.unwrap().len(),
        builtin_names().count()
    );
    assert_eq!(lines(dir.path(), Collection::Categories).len(), 9);

    // History keeps appending across sessions.
    let stashes = backend.stashes().await.unwrap();
    let mut stash = Stash::try_from(stashes.get(&stash_id).await.unwrap()).unwrap();
    stash.increment(1).unwrap();
    stashes.set(&stash_id, stash.into()).await.unwrap();
    let history: Vec<StashHistoryEntry> =
        jsonl::read_all(&dir.path().join(Collection::StashHistory.file_name())).unwrap();
    let versions: Vec<i64> = history.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2]);

    backend.detach().await.unwrap();
}

#[tokio::test]
async fn detach_retries_after_failed_flush() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::on_close()).await;
    let stashes = backend.stashes().await.unwrap();
    let links = backend.links().await.unwrap();

    stashes.set("", Stash::counter("c").into()).await.unwrap();
    links
        .set("", Link::new(LinkType::ChildOf, "a", "b").into())
        .await
        .unwrap();

    // Block the links rewrite by putting a directory where the file goes.
    let links_path = dir.path().join(Collection::Links.file_name());
    std::fs::remove_file(&links_path).unwrap();
    std::fs::create_dir(&links_path).unwrap();

    assert!(backend.detach().await.is_err());
    assert!(backend.is_attached().await);
    assert_eq!(backend.pending_writes().await.unwrap(), 1);

    std::fs::remove_dir(&links_path).unwrap();
    backend.detach().await.unwrap();
    assert!(!backend.is_attached().await);

    assert_eq!(lines(dir.path(), Collection::Links).len(), 1);
    assert_eq!(lines(dir.path(), Collection::StashHistory).len(), 1);
}

#[tokio::test]
async fn failed_history_append_retried_once() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::on_close()).await;
    let stashes = backend.stashes().await.unwrap();
    let links = backend.links().await.unwrap();

    links
        .set("", Link::new(LinkType::ScopedTo, "a", "b").into())
        .await
        .unwrap();
    let Entity::Stash(mut counter) = stashes.set("", Stash::counter("c").into()).await.unwrap()
    else {
        panic!("expected a stash");
    };
    counter.increment(3).unwrap();
    stashes.set(&counter.id.clone(), counter.into()).await.unwrap();

    let history_path = dir.path().join(Collection::StashHistory.file_name());
    std::fs::remove_file(&history_path).unwrap();
    std::fs::create_dir(&history_path).unwrap();

    assert!(backend.detach().await.is_err());
    assert!(backend.is_attached().await);
    assert_eq!(backend.pending_writes().await.unwrap(), 2);
    assert_eq!(lines(dir.path(), Collection::Links).len(), 1);

    std::fs::remove_dir(&history_path).unwrap();
    backend.detach().await.unwrap();

    let history: Vec<StashHistoryEntry> = jsonl::read_all(&history_path).unwrap();
    let ops: Vec<(i64, &str)> = history
        .iter()
        .map(|e| (e.version, e.operation.as_str()))
        .collect();
    assert_eq!(ops, vec![(1, "create"), (2, "increment")]);
}

#[tokio::test]
async fn stale_accessor_fails_after_detach() {
    let dir = tempfile::tempdir().unwrap();
    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    let crumbs = backend.crumbs().await.unwrap();
    let by_name = backend.table(TableName::Crumbs).await.unwrap();

    backend.detach().await.unwrap();

    assert!(matches!(crumbs.fetch(None).await, Err(StoreError::Detached)));
    assert!(matches!(
        by_name.get("anything").await,
        Err(StoreError::Detached)
    ));
    assert!(matches!(backend.crumbs().await, Err(StoreError::Detached)));
}

#[tokio::test]
async fn attach_discards_stale_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.db"), b"garbage, not sqlite").unwrap();

    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    assert!(backend.trails().await.unwrap().fetch(None).await.unwrap().is_empty());
    backend.detach().await.unwrap();
}

#[tokio::test]
async fn partial_trailing_line_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let trail = Trail::new();
    let mut content = serde_json::to_string(&trail).unwrap();
    content.push('\n');
    content.push_str(r#"{"id": "half"#);
    std::fs::write(dir.path().join("trails.jsonl"), content).unwrap();

    let backend = attached(dir.path(), SyncConfig::immediate()).await;
    let trails = backend.trails().await.unwrap();
    let loaded = trails.fetch(None).await.unwrap();
    assert_eq!(loaded, vec![Entity::Trail(trail)]);
    backend.detach().await.unwrap();
}
