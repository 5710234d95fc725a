//! Single-context behaviour of the store: live queries, the log, persistence.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{all_todos, fast_config, schema, schema_builder};
use loam::core::{
    ColumnDef, ColumnType, EventId, LiveQueryDef, OriginId, SyncStatus, TableDef,
};
use loam::inspect::{self, ExportTarget};
use loam::{StorageBackend, Store, StoreOptions};
use serde_json::{json, Value};
use tempfile::tempdir;

fn recomputations(store: &Store, label: &str) -> u64 {
    store.graph_snapshot(false).node(label).unwrap().recomputations
}

#[tokio::test]
async fn test_todo_insert_recomputes_once() {
    let dir = tempdir().unwrap();
    let store = Store::open(schema(), StoreOptions::new(dir.path()).config(fast_config()))
        .await
        .unwrap();
    assert!(store.is_leader().await);

    let todos = store.subscribe(&all_todos());
    assert_eq!(todos.get().unwrap(), json!([]));
    assert_eq!(recomputations(&store, "todos"), 1);

    store
        .commit("addTodo", json!({"id": "t1", "text": "buy milk"}))
        .await
        .unwrap();
    assert!(todos.has_changed());
    assert_eq!(
        todos.get().unwrap(),
        json!([{"id": "t1", "text": "buy milk", "completed": false}])
    );
    todos.get().unwrap();
    assert_eq!(recomputations(&store, "todos"), 2);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_derived_filter_invalidates_once() {
    let dir = tempdir().unwrap();
    let store = Store::open(schema(), StoreOptions::new(dir.path()).config(fast_config()))
        .await
        .unwrap();

    let source = all_todos();
    let open_todos = {
        let source = source.clone();
        LiveQueryDef::computed(move |get| {
            let rows = get.get(&source)?;
            let open: Vec<Value> = rows
                .as_array()
                .into_iter()
                .flatten()
                .filter(|row| row["completed"] == json!(false))
                .cloned()
                .collect();
            Ok(Value::Array(open))
        })
        .with_label("open")
    };

    let open = store.subscribe(&open_todos);
    assert_eq!(open.get().unwrap(), json!([]));

    store
        .commit("addTodo", json!({"id": "t1", "text": "buy milk"}))
        .await
        .unwrap();
    assert_eq!(
        open.get().unwrap(),
        json!([{"id": "t1", "text": "buy milk", "completed": false}])
    );
    assert_eq!(recomputations(&store, "open"), 2);
    assert_eq!(recomputations(&store, "todos"), 2);

    store
        .commit("completeTodo", json!({"id": "t1"}))
        .await
        .unwrap();
    assert_eq!(open.get().unwrap(), json!([]));
    assert_eq!(recomputations(&store, "open"), 3);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_batch_is_rejected_whole() {
    let dir = tempdir().unwrap();
    let store = Store::open(schema(), StoreOptions::new(dir.path()).config(fast_config()))
        .await
        .unwrap();

    let good = store
        .event("addTodo", json!({"id": "t1", "text": "a"}))
        .unwrap();
    let mut stale = store
        .event("addTodo", json!({"id": "t2", "text": "b"}))
        .unwrap();
    stale.schema_hash ^= 1;

    let err = store.mutate(vec![good, stale]).await.unwrap_err();
    assert_eq!(err.error_code(), "schema_violation");
    assert!(err.is_fatal());
    assert_eq!(store.query(&all_todos()).unwrap(), json!([]));
    assert_eq!(store.log_stats().await.unwrap().total, 0);

    let err = store.event("noSuchMutation", json!({})).unwrap_err();
    assert_eq!(err.error_code(), "schema_violation");

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_log_statuses_and_raw_execute() {
    let dir = tempdir().unwrap();
    let store = Store::open(schema(), StoreOptions::new(dir.path()).config(fast_config()))
        .await
        .unwrap();

    store
        .commit("addTodo", json!({"id": "t1", "text": "a"}))
        .await
        .unwrap();
    store
        .commit("setUi", json!({"key": "filter", "value": {"done": false}}))
        .await
        .unwrap();
    store
        .execute(
            "DELETE FROM todos",
            Value::Null,
            BTreeSet::from(["todos".to_string()]),
        )
        .await
        .unwrap();

    let entries = store.log_entries().await.unwrap();
    let statuses: Vec<SyncStatus> = entries.iter().map(|e| e.sync_status).collect();
    assert_eq!(statuses, vec![SyncStatus::Pending, SyncStatus::LocalOnly]);
    let stats = store.log_stats().await.unwrap();
    assert_eq!((stats.pending, stats.local_only, stats.synced), (1, 1, 0));
    assert_eq!(stats.cursor, None);

    // the raw statement ran but left no log entry
    assert_eq!(store.query(&all_todos()).unwrap(), json!([]));

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = Store::open(schema(), StoreOptions::new(dir.path()).config(fast_config()))
        .await
        .unwrap();
    store.shutdown().await.unwrap();
    store.shutdown().await.unwrap();

    let err = store
        .commit("addTodo", json!({"id": "t1", "text": "a"}))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "closed");
    assert!(!store.is_leader().await);

    // the lease is free again
    let again = Store::open(schema(), StoreOptions::new(dir.path()).config(fast_config()))
        .await
        .unwrap();
    assert!(again.is_leader().await);
    again.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_backend_reopens_with_data() {
    let dir = tempdir().unwrap();
    let options = StoreOptions::new(dir.path()).config(fast_config());
    let store = Store::open(schema(), options.clone()).await.unwrap();
    let id = store
        .commit("addTodo", json!({"id": "t1", "text": "a"}))
        .await
        .unwrap();
    store.shutdown().await.unwrap();

    let store = Store::open(schema(), options).await.unwrap();
    assert_eq!(store.query(&all_todos()).unwrap()[0]["id"], "t1");
    let entries = store.log_entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event.id, id);
    store.shutdown().await.unwrap();

    let report = inspect::status(dir.path(), StorageBackend::File).unwrap();
    assert!(!report.locked);
    assert_eq!(report.log.unwrap().total, 1);
    assert_eq!(report.app_stores.len(), 1);
    let log = inspect::read_log(dir.path(), StorageBackend::File, Some(SyncStatus::Pending)).unwrap();
    assert_eq!(log.len(), 1);
    assert!(!inspect::export(dir.path(), StorageBackend::File, ExportTarget::Log)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_blob_backend_persists_after_debounce() {
    let dir = tempdir().unwrap();
    let options = StoreOptions::new(dir.path())
        .config(fast_config())
        .backend(StorageBackend::Blob);
    let store = Store::open(schema(), options.clone()).await.unwrap();
    store
        .commit("addTodo", json!({"id": "t1", "text": "a"}))
        .await
        .unwrap();
    // let the debounced flush run on its own
    tokio::time::sleep(Duration::from_millis(100)).await;
    store
        .commit("addTodo", json!({"id": "t2", "text": "b"}))
        .await
        .unwrap();
    // shutdown flushes whatever the debounce has not
    store.shutdown().await.unwrap();

    let store = Store::open(schema(), options).await.unwrap();
    let todos = store.query(&all_todos()).unwrap();
    assert_eq!(todos.as_array().unwrap().len(), 2);
    assert_eq!(store.log_stats().await.unwrap().total, 2);
    store.shutdown().await.unwrap();

    let report = inspect::status(dir.path(), StorageBackend::Blob).unwrap();
    assert_eq!(report.log.unwrap().total, 2);
}

#[tokio::test]
async fn test_memory_backend_forgets() {
    let dir = tempdir().unwrap();
    let options = StoreOptions::new(dir.path())
        .config(fast_config())
        .backend(StorageBackend::Memory);
    let store = Store::open(schema(), options.clone()).await.unwrap();
    store
        .commit("addTodo", json!({"id": "t1", "text": "a"}))
        .await
        .unwrap();
    store.shutdown().await.unwrap();

    let store = Store::open(schema(), options).await.unwrap();
    assert_eq!(store.query(&all_todos()).unwrap(), json!([]));
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schema_change_recreates_from_log() {
    let dir = tempdir().unwrap();
    let options = StoreOptions::new(dir.path()).config(fast_config());
    let store = Store::open(schema(), options.clone()).await.unwrap();
    for id in ["t1", "t2"] {
        store
            .commit("addTodo", json!({"id": id, "text": "x"}))
            .await
            .unwrap();
    }
    store.shutdown().await.unwrap();

    let extended = schema_builder()
        .table(TableDef::new("tags").column(ColumnDef::new("name", ColumnType::Text).primary_key()))
        .build()
        .unwrap();
    let store = Store::open(extended, options).await.unwrap();
    assert_eq!(store.query(&all_todos()).unwrap().as_array().unwrap().len(), 2);
    store.shutdown().await.unwrap();

    let report = inspect::status(dir.path(), StorageBackend::File).unwrap();
    assert_eq!(report.app_stores.len(), 2);
}

#[tokio::test]
async fn test_recreate_flag_rebuilds_app_store() {
    let dir = tempdir().unwrap();
    let options = StoreOptions::new(dir.path()).config(fast_config());
    let store = Store::open(schema(), options.clone()).await.unwrap();
    store
        .commit("addTodo", json!({"id": "t1", "text": "x"}))
        .await
        .unwrap();
    // raw statements are not logged, so recreation drops their effect
    store
        .execute(
            "INSERT INTO todos (id, text, completed) VALUES ('raw', 'r', 0)",
            Value::Null,
            BTreeSet::from(["todos".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(store.query(&all_todos()).unwrap().as_array().unwrap().len(), 2);
    store.shutdown().await.unwrap();

    let store = Store::open(schema(), options.recreate(true)).await.unwrap();
    let todos = store.query(&all_todos()).unwrap();
    assert_eq!(todos, json!([{"id": "t1", "text": "x", "completed": false}]));
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_ids_sort_with_local_ones() {
    let dir = tempdir().unwrap();
    let store = Store::open(schema(), StoreOptions::new(dir.path()).config(fast_config()))
        .await
        .unwrap();
    let early = store
        .schema()
        .event(
            EventId::new(1, 0, OriginId::from_bytes([3; 8])),
            "addTodo",
            json!({"id": "early", "text": "e"}),
        )
        .unwrap();
    let late = store
        .event("addTodo", json!({"id": "late", "text": "l"}))
        .unwrap();
    store.mutate(vec![late, early]).await.unwrap();

    let ids: Vec<String> = store
        .log_entries()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event.args["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["early", "late"]);
    assert_eq!(store.query(&all_todos()).unwrap().as_array().unwrap().len(), 2);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lower_id_delete_after_local_insert() {
    let dir = tempdir().unwrap();
    let options = StoreOptions::new(dir.path()).config(fast_config());
    let store = Store::open(schema(), options.clone()).await.unwrap();
    let todos = store.subscribe(&all_todos());
    store
        .commit("addTodo", json!({"id": "t1", "text": "x"}))
        .await
        .unwrap();
    assert_eq!(todos.get().unwrap().as_array().unwrap().len(), 1);

    // authored elsewhere before the insert: in log order it deletes nothing
    let delete = store
        .schema()
        .event(
            EventId::new(1, 0, OriginId::from_bytes([3; 8])),
            "deleteTodo",
            json!({"id": "t1"}),
        )
        .unwrap();
    store.mutate(vec![delete]).await.unwrap();
    let live = todos.get().unwrap();
    assert_eq!(live, json!([{"id": "t1", "text": "x", "completed": false}]));
    store.shutdown().await.unwrap();

    let store = Store::open(schema(), options.recreate(true)).await.unwrap();
    assert_eq!(store.query(&all_todos()).unwrap(), live);
    store.shutdown().await.unwrap();
}
