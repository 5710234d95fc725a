//! Reactivity Graph
//!
//! Live queries and derived values form a dependency graph. Committed writes
//! invalidate nodes by table (push); values are recomputed lazily on the next
//! read (pull), at most once per invalidation epoch.

pub mod def;
pub mod graph;

use std::fmt;

use serde_json::Value;

use crate::db::{Row, SharedDb};
use crate::error::LoamError;

pub use def::{LiveQueryDef, NodeKey, QuerySpec};
pub use graph::{Get, GraphSnapshot, NodeId, NodeSnapshot, NodeState, ReactivityGraph, Subscription};

/// Read-only access to the store a graph's queries run against
pub trait QueryExecutor: Send + Sync {
    fn select(&self, sql: &str, bind: &Value) -> Result<Vec<Row>, LoamError>;
}

impl QueryExecutor for SharedDb {
    fn select(&self, sql: &str, bind: &Value) -> Result<Vec<Row>, LoamError> {
        self.lock().select(sql, bind)
    }
}

/// Executor for a context that has no store yet; every query fails
#[derive(Debug, Default)]
pub struct Unavailable;

impl QueryExecutor for Unavailable {
    fn select(&self, _sql: &str, _bind: &Value) -> Result<Vec<Row>, LoamError> {
        Err(LoamError::NotFound("no store is attached to this graph".to_string()))
    }
}

/// A failed node computation. Cached on the node and handed to every
/// consumer until the node is invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecomputeFailure {
    /// Label of the node whose computation failed
    pub node: Option<String>,
    pub message: String,
}

impl RecomputeFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            node: None,
            message: message.into(),
        }
    }

    pub(crate) fn at(mut self, label: &str) -> Self {
        if self.node.is_none() {
            self.node = Some(label.to_string());
        }
        self
    }
}

impl fmt::Display for RecomputeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "recomputation of '{}' failed: {}", node, self.message),
            None => write!(f, "recomputation failed: {}", self.message),
        }
    }
}

impl From<String> for RecomputeFailure {
    fn from(message: String) -> Self {
        RecomputeFailure::new(message)
    }
}

impl From<&str> for RecomputeFailure {
    fn from(message: &str) -> Self {
        RecomputeFailure::new(message)
    }
}

impl From<LoamError> for RecomputeFailure {
    fn from(err: LoamError) -> Self {
        match err {
            LoamError::Recomputation(failure) => failure,
            other => RecomputeFailure::new(other.to_string()),
        }
    }
}
