//! Sync engine against an in-memory remote and a real mutation log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libloam_core::materialize;
use libloam_core::{
    ApplyPipeline, ColumnDef, ColumnType, EventId, EventIdGenerator, EventLog, ExecutionItem,
    LoamError, LogEntry, MutationDef, MutationEvent, Origin, OriginId, RemoteEvent, Schema, SqliteDb,
    SyncStatus, TableDef,
};
use libloam_sync::{LogSink, MemoryBackend, SyncEngine, SyncOptions, SyncProgress};
use serde_json::json;
use tokio::sync::watch;

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .table(
                TableDef::new("todos")
                    .column(ColumnDef::new("id", ColumnType::Text).primary_key())
                    .column(ColumnDef::new("text", ColumnType::Text)),
            )
            .table(
                TableDef::new("ui")
                    .column(ColumnDef::new("key", ColumnType::Text).primary_key())
                    .column(ColumnDef::new("value", ColumnType::Text)),
            )
            .mutation(
                MutationDef::new("addTodo", "INSERT INTO todos (id, text) VALUES (:id, :text)")
                    .arg("id", ColumnType::Text)
                    .arg("text", ColumnType::Text),
            )
            .mutation(
                MutationDef::new("setUi", "INSERT OR REPLACE INTO ui (key, value) VALUES (:key, :value)")
                    .arg("key", ColumnType::Text)
                    .arg("value", ColumnType::Text)
                    .local_only(),
            )
            .build()
            .unwrap(),
    )
}

struct Stores {
    app: SqliteDb,
    log: EventLog,
}

struct TestSink {
    pipeline: ApplyPipeline,
    stores: Mutex<Stores>,
}

impl TestSink {
    fn new(schema: Arc<Schema>) -> Arc<Self> {
        let mut app = SqliteDb::open_in_memory("app").unwrap();
        materialize::ensure_tables(&mut app, &schema).unwrap();
        let log = EventLog::open(SqliteDb::open_in_memory("log").unwrap()).unwrap();
        Arc::new(Self {
            pipeline: ApplyPipeline::new(schema, 50),
            stores: Mutex::new(Stores { app, log }),
        })
    }

    fn commit_local(&self, events: Vec<MutationEvent>) {
        let items: Vec<_> = events.into_iter().map(ExecutionItem::mutate).collect();
        let mut stores = self.stores.lock().unwrap();
        let Stores { app, log } = &mut *stores;
        self.pipeline
            .apply_batch(app, log, &items, Origin::Local)
            .unwrap();
    }

    fn entry(&self, id: &EventId) -> LogEntry {
        self.stores.lock().unwrap().log.get(id).unwrap().unwrap()
    }

    fn log_cursor(&self) -> Option<EventId> {
        self.stores.lock().unwrap().log.cursor().unwrap()
    }

    fn todo_count(&self) -> usize {
        self.stores
            .lock()
            .unwrap()
            .app
            .select("SELECT * FROM todos", &serde_json::Value::Null)
            .unwrap()
            .len()
    }
}

#[async_trait]
impl LogSink for TestSink {
    async fn cursor(&self) -> Result<Option<EventId>, LoamError> {
        self.stores.lock().unwrap().log.cursor()
    }

    async fn pending(&self, limit: usize) -> Result<Vec<LogEntry>, LoamError> {
        self.stores.lock().unwrap().log.pending(limit)
    }

    async fn contains(&self, id: EventId) -> Result<bool, LoamError> {
        self.stores.lock().unwrap().log.contains(&id)
    }

    async fn apply_remote(&self, events: Vec<RemoteEvent>) -> Result<(), LoamError> {
        let items: Vec<_> = events.into_iter().map(ExecutionItem::remote).collect();
        let mut stores = self.stores.lock().unwrap();
        let Stores { app, log } = &mut *stores;
        for chunk in items.chunks(self.pipeline.batch_size()) {
            self.pipeline.apply_batch(app, log, chunk, Origin::Remote)?;
        }
        Ok(())
    }

    async fn confirm(&self, id: EventId) -> Result<bool, LoamError> {
        self.stores.lock().unwrap().log.mark_synced(&id)
    }
}

fn options() -> SyncOptions {
    SyncOptions {
        page_size: 3,
        push_retry: Duration::from_millis(10),
    }
}

async fn wait_for(
    progress: &mut watch::Receiver<SyncProgress>,
    pred: impl Fn(&SyncProgress) -> bool,
) -> SyncProgress {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = progress.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            progress.changed().await.unwrap();
        }
    })
    .await
    .expect("sync progress condition not reached")
}

#[tokio::test]
async fn test_initial_pull_waits_for_connectivity() {
    let schema = schema();
    let remote = MemoryBackend::new();
    let mut remote_ids = EventIdGenerator::new(OriginId::from_bytes([2; 8]));
    for i in 0..7 {
        remote.insert_remote(
            schema
                .event(remote_ids.next_id(), "addTodo", json!({"id": format!("r{}", i), "text": "x"}))
                .unwrap(),
        );
    }
    remote.set_connected(false);

    let sink = TestSink::new(schema.clone());
    let handle = SyncEngine::spawn(Arc::new(remote.clone()), sink.clone(), options());
    let mut progress = handle.progress();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!progress.borrow().initial_pull_done);
    assert_eq!(sink.todo_count(), 0);

    remote.set_connected(true);
    let done = wait_for(&mut progress, |p| p.initial_pull_done).await;
    assert_eq!(done.pulled, 7);
    assert_eq!(sink.todo_count(), 7);
    assert_eq!(sink.log_cursor(), remote.events().last().map(|e| e.id));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pending_push_retried_after_reconnect() {
    let schema = schema();
    let remote = MemoryBackend::new();
    remote.set_connected(false);
    let sink = TestSink::new(schema.clone());
    let mut ids = EventIdGenerator::new(OriginId::from_bytes([1; 8]));

    let event = schema
        .event(ids.next_id(), "addTodo", json!({"id": "t1", "text": "buy milk"}))
        .unwrap();
    let id = event.id;
    sink.commit_local(vec![event]);

    let handle = SyncEngine::spawn(Arc::new(remote.clone()), sink.clone(), options());
    let mut progress = handle.progress();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(sink.entry(&id).sync_status, SyncStatus::Pending);
    assert!(!remote.contains(&id));

    remote.set_connected(true);
    let done = wait_for(&mut progress, |p| p.pushed == 1).await;
    assert_eq!(done.cursor, Some(id));
    assert_eq!(sink.entry(&id).sync_status, SyncStatus::Synced);
    assert_eq!(sink.log_cursor(), Some(id));
    assert!(remote.contains(&id));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transport_failure_is_retried_while_connected() {
    let schema = schema();
    let remote = MemoryBackend::new();
    remote.fail_next_pushes(2);
    let sink = TestSink::new(schema.clone());
    let mut ids = EventIdGenerator::new(OriginId::from_bytes([1; 8]));
    let event = schema
        .event(ids.next_id(), "addTodo", json!({"id": "t1", "text": "a"}))
        .unwrap();
    let id = event.id;
    sink.commit_local(vec![event]);

    let handle = SyncEngine::spawn(Arc::new(remote.clone()), sink.clone(), options());
    let mut progress = handle.progress();
    let done = wait_for(&mut progress, |p| p.pushed == 1).await;
    assert!(done.failed >= 2);
    assert_eq!(sink.entry(&id).sync_status, SyncStatus::Synced);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_only_entries_never_pushed() {
    let schema = schema();
    let remote = MemoryBackend::new();
    let sink = TestSink::new(schema.clone());
    let mut ids = EventIdGenerator::new(OriginId::from_bytes([1; 8]));

    let ui = schema
        .event(ids.next_id(), "setUi", json!({"key": "filter", "value": "all"}))
        .unwrap();
    let ui_id = ui.id;
    let todo = schema
        .event(ids.next_id(), "addTodo", json!({"id": "t1", "text": "a"}))
        .unwrap();
    let todo_id = todo.id;
    sink.commit_local(vec![ui, todo]);

    let handle = SyncEngine::spawn(Arc::new(remote.clone()), sink.clone(), options());
    let mut progress = handle.progress();
    wait_for(&mut progress, |p| p.pushed == 1).await;

    let ui_after_todo = schema
        .event(ids.next_id(), "setUi", json!({"key": "filter", "value": "done"}))
        .unwrap();
    let late_ui_id = ui_after_todo.id;
    sink.commit_local(vec![ui_after_todo]);
    handle.notify_pending();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!remote.contains(&ui_id));
    assert!(!remote.contains(&late_ui_id));
    assert_eq!(sink.entry(&ui_id).sync_status, SyncStatus::LocalOnly);
    assert_eq!(sink.log_cursor(), Some(todo_id));
    assert_eq!(progress.borrow().cursor, Some(todo_id));
    assert_eq!(remote.accepted_pushes(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_live_events_applied_and_replays_dropped() {
    let schema = schema();
    let remote = MemoryBackend::new();
    let sink = TestSink::new(schema.clone());
    let handle = SyncEngine::spawn(Arc::new(remote.clone()), sink.clone(), options());
    let mut progress = handle.progress();
    wait_for(&mut progress, |p| p.initial_pull_done).await;

    let mut other = EventIdGenerator::new(OriginId::from_bytes([7; 8]));
    let first = schema
        .event(other.next_at(1_000), "addTodo", json!({"id": "r1", "text": "a"}))
        .unwrap();
    let second = schema
        .event(other.next_at(2_000), "addTodo", json!({"id": "r2", "text": "b"}))
        .unwrap();
    remote.insert_remote(second.clone());
    wait_for(&mut progress, |p| p.cursor == Some(second.id)).await;

    // behind the cursor: dropped by the replay guard
    remote.insert_remote(first.clone());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(sink.todo_count(), 1);
    assert_eq!(progress.borrow().cursor, Some(second.id));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_persisted_flag_recorded() {
    let schema = schema();
    let remote = MemoryBackend::new();
    let mut other = EventIdGenerator::new(OriginId::from_bytes([7; 8]));
    let kept = schema
        .event(other.next_at(1_000), "addTodo", json!({"id": "r1", "text": "a"}))
        .unwrap();
    let relayed = schema
        .event(other.next_at(2_000), "addTodo", json!({"id": "r2", "text": "b"}))
        .unwrap();
    remote.insert_remote(kept.clone());
    remote.insert_remote(RemoteEvent::transient(relayed.clone()));

    let sink = TestSink::new(schema.clone());
    let handle = SyncEngine::spawn(Arc::new(remote.clone()), sink.clone(), options());
    let mut progress = handle.progress();
    wait_for(&mut progress, |p| p.pulled == 2).await;

    assert!(sink.entry(&kept.id).persisted);
    let entry = sink.entry(&relayed.id);
    assert!(!entry.persisted);
    assert_eq!(entry.sync_status, SyncStatus::Synced);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cursor_monotonic_under_mixed_confirmations() {
    let schema = schema();
    let remote = MemoryBackend::new();
    let sink = TestSink::new(schema.clone());
    let mut local = EventIdGenerator::new(OriginId::from_bytes([1; 8]));
    let mut other = EventIdGenerator::new(OriginId::from_bytes([9; 8]));

    let handle = SyncEngine::spawn(Arc::new(remote.clone()), sink.clone(), options());
    let mut progress = handle.progress();
    wait_for(&mut progress, |p| p.initial_pull_done).await;

    let mut seen = Vec::new();
    for round in 0..5u64 {
        let event = schema
            .event(
                local.next_at(10_000 + round * 10),
                "addTodo",
                json!({"id": format!("l{}", round), "text": "x"}),
            )
            .unwrap();
        sink.commit_local(vec![event]);
        handle.notify_pending();
        remote.insert_remote(
            schema
                .event(
                    other.next_at(10_000 + round * 10 + 5),
                    "addTodo",
                    json!({"id": format!("o{}", round), "text": "y"}),
                )
                .unwrap(),
        );
        let p = wait_for(&mut progress, |p| p.pushed == round + 1).await;
        seen.push(p.cursor);
    }
    let done = wait_for(&mut progress, |p| p.pulled == 5).await;
    seen.push(done.cursor);

    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(sink.todo_count(), 10);
    assert!(sink.log_cursor() <= done.cursor);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_while_offline() {
    let remote = MemoryBackend::new();
    remote.set_connected(false);
    let sink = TestSink::new(schema());
    let handle = SyncEngine::spawn(Arc::new(remote), sink, options());
    handle.shutdown().await.unwrap();
}
