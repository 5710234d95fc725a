use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::graph::Get;
use super::RecomputeFailure;
use crate::schema::{queried_tables, ColumnType, TableDef};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// A read against the Materialized Store
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub sql: String,
    pub bind: Value,
    /// Tables the query reads; extracted from the text when not given
    pub tables: Option<BTreeSet<String>>,
    /// Decode hints by column name
    pub columns: BTreeMap<String, ColumnType>,
}

impl QuerySpec {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bind: Value::Null,
            tables: None,
            columns: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, bind: Value) -> Self {
        self.bind = bind;
        self
    }

    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    /// Decode results with the column types of `table`
    pub fn decode_as(mut self, table: &TableDef) -> Self {
        self.columns.extend(table.column_types());
        self
    }

    pub fn columns(mut self, columns: BTreeMap<String, ColumnType>) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn table_set(&self) -> BTreeSet<String> {
        self.tables
            .clone()
            .unwrap_or_else(|| queried_tables(&self.sql))
    }

    fn structural_key(&self) -> String {
        let shape = json!({
            "sql": self.sql,
            "bind": self.bind,
            "tables": self.tables,
            "columns": self.columns,
        });
        hex::encode(&Sha256::digest(shape.to_string().as_bytes())[..12])
    }
}

/// Identity of a graph node.
///
/// Static queries are identified by their structure, so two equal
/// definitions share one node. Definitions holding closures cannot be
/// compared and are identified by the definition instance (clones share it).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Structural(String),
    Instance(u64),
}

impl NodeKey {
    fn instance() -> Self {
        NodeKey::Instance(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }
}

pub type MapFn = Arc<dyn Fn(Value) -> Result<Value, RecomputeFailure> + Send + Sync>;
pub type ComposeFn =
    Arc<dyn Fn(&mut Get<'_>) -> Result<QuerySpec, RecomputeFailure> + Send + Sync>;
pub type ComputeFn = Arc<dyn Fn(&mut Get<'_>) -> Result<Value, RecomputeFailure> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum DefKind {
    Query(QuerySpec),
    Composed(ComposeFn),
    Computed(ComputeFn),
}

impl DefKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            DefKind::Query(_) => "query",
            DefKind::Composed(_) => "composed",
            DefKind::Computed(_) => "computed",
        }
    }
}

#[derive(Clone)]
struct DefInner {
    key: NodeKey,
    label: String,
    kind: DefKind,
    map: Option<MapFn>,
}

/// Declarative description of a live read.
///
/// Cheap to clone; clones denote the same graph node.
#[derive(Clone)]
pub struct LiveQueryDef {
    inner: Arc<DefInner>,
}

impl fmt::Debug for LiveQueryDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryDef")
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind.name())
            .field("key", &self.inner.key)
            .finish()
    }
}

impl LiveQueryDef {
    /// A query with fixed text and bind values
    pub fn query(spec: QuerySpec) -> Self {
        Self::from_inner(DefInner {
            key: NodeKey::Structural(spec.structural_key()),
            label: spec.sql.clone(),
            kind: DefKind::Query(spec),
            map: None,
        })
    }

    /// A query whose text is derived from other nodes
    pub fn composed<F>(f: F) -> Self
    where
        F: Fn(&mut Get<'_>) -> Result<QuerySpec, RecomputeFailure> + Send + Sync + 'static,
    {
        Self::from_inner(DefInner {
            key: NodeKey::instance(),
            label: "composed".to_string(),
            kind: DefKind::Composed(Arc::new(f)),
            map: None,
        })
    }

    /// A pure function of other nodes' values
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&mut Get<'_>) -> Result<Value, RecomputeFailure> + Send + Sync + 'static,
    {
        Self::from_inner(DefInner {
            key: NodeKey::instance(),
            label: "computed".to_string(),
            kind: DefKind::Computed(Arc::new(f)),
            map: None,
        })
    }

    fn from_inner(inner: DefInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn with_label(self, label: impl Into<String>) -> Self {
        let mut inner = (*self.inner).clone();
        inner.label = label.into();
        Self::from_inner(inner)
    }

    /// Post-process the value (rows for queries) before it is cached
    pub fn with_map<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, RecomputeFailure> + Send + Sync + 'static,
    {
        let mut inner = (*self.inner).clone();
        inner.map = Some(Arc::new(f));
        inner.key = NodeKey::instance();
        Self::from_inner(inner)
    }

    /// Keep only the first row, or `fallback` when there is none
    pub fn first_or(self, fallback: Value) -> Self {
        self.with_map(move |rows| {
            Ok(rows
                .as_array()
                .and_then(|r| r.first().cloned())
                .unwrap_or_else(|| fallback.clone()))
        })
    }

    pub fn key(&self) -> &NodeKey {
        &self.inner.key
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub(crate) fn kind(&self) -> &DefKind {
        &self.inner.kind
    }

    pub(crate) fn map_fn(&self) -> Option<&MapFn> {
        self.inner.map.as_ref()
    }
}
