#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use loam::core::{
    ColumnDef, ColumnType, EngineConfig, LiveQueryDef, MutationDef, QuerySpec, Schema, TableDef,
};
use tokio::sync::watch;

pub fn todos_table() -> TableDef {
    TableDef::new("todos")
        .column(ColumnDef::new("id", ColumnType::Text).primary_key())
        .column(ColumnDef::new("text", ColumnType::Text))
        .column(ColumnDef::new("completed", ColumnType::Boolean))
}

pub fn schema_builder() -> loam::core::SchemaBuilder {
    Schema::builder()
        .table(todos_table())
        .table(
            TableDef::new("ui_state")
                .column(ColumnDef::new("key", ColumnType::Text).primary_key())
                .column(ColumnDef::new("value", ColumnType::Json).nullable()),
        )
        .mutation(
            MutationDef::new(
                "addTodo",
                "INSERT INTO todos (id, text, completed) VALUES (:id, :text, 0)",
            )
            .arg("id", ColumnType::Text)
            .arg("text", ColumnType::Text),
        )
        .mutation(
            MutationDef::new("completeTodo", "UPDATE todos SET completed = 1 WHERE id = :id")
                .arg("id", ColumnType::Text),
        )
        .mutation(
            MutationDef::new("deleteTodo", "DELETE FROM todos WHERE id = :id")
                .arg("id", ColumnType::Text),
        )
        .mutation(
            MutationDef::new(
                "setUi",
                "INSERT OR REPLACE INTO ui_state (key, value) VALUES (:key, :value)",
            )
            .arg("key", ColumnType::Text)
            .arg("value", ColumnType::Json)
            .local_only(),
        )
}

pub fn schema() -> Schema {
    schema_builder().build().unwrap()
}

/// Short timers so persistence and retries happen within a test
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        persist_debounce_ms: 20,
        graph_retention_ms: 0,
        push_retry_ms: 20,
        ..EngineConfig::default()
    }
}

pub fn all_todos() -> LiveQueryDef {
    LiveQueryDef::query(
        QuerySpec::new("SELECT id, text, completed FROM todos ORDER BY id").decode_as(&todos_table()),
    )
    .with_label("todos")
}

pub async fn wait_for<T>(rx: &mut watch::Receiver<T>, f: impl FnMut(&T) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Retry `check` until it returns true or five seconds pass
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
