use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::def::{DefKind, LiveQueryDef, NodeKey, QuerySpec};
use super::{QueryExecutor, RecomputeFailure};
use crate::error::LoamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    /// Cached value is current
    Fresh,
    /// Some ancestor was invalidated; the value may or may not have changed
    Dirty,
    /// A table this node reads was written; must recompute
    Stale,
}

struct Node {
    key: NodeKey,
    def: LiveQueryDef,
    state: NodeState,
    value: Option<Result<Value, RecomputeFailure>>,
    /// Tables read directly by this node's own query
    tables: BTreeSet<String>,
    deps: BTreeSet<NodeId>,
    dependents: BTreeSet<NodeId>,
    subscribers: usize,
    /// Epoch at which the cached value last changed
    changed_at: u64,
    /// Epoch at which the cached value was last confirmed current
    verified_at: u64,
    recomputations: u64,
    released_at: Option<Instant>,
    notify: watch::Sender<u64>,
}

struct GraphInner {
    executor: Arc<dyn QueryExecutor>,
    nodes: HashMap<NodeId, Node>,
    by_key: HashMap<NodeKey, NodeId>,
    next_id: u64,
    epoch: u64,
    retention: Duration,
    computing: Vec<NodeId>,
}

/// Dependency-recording accessor handed to composed and computed nodes
pub struct Get<'a> {
    graph: &'a mut GraphInner,
    node: NodeId,
}

impl Get<'_> {
    /// Read another node's current value, recording it as a dependency
    pub fn get(&mut self, def: &LiveQueryDef) -> Result<Value, RecomputeFailure> {
        let dep = self.graph.node_for(def);
        if self.graph.computing.contains(&dep) {
            return Err(RecomputeFailure::new(format!(
                "dependency cycle through '{}'",
                def.label()
            )));
        }
        self.graph.link(self.node, dep);
        self.graph.ensure_fresh(dep);
        self.graph.value_of(dep)
    }
}

impl GraphInner {
    fn node_for(&mut self, def: &LiveQueryDef) -> NodeId {
        if let Some(id) = self.by_key.get(def.key()) {
            return *id;
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let (notify, _) = watch::channel(self.epoch);
        self.nodes.insert(
            id,
            Node {
                key: def.key().clone(),
                def: def.clone(),
                state: NodeState::Stale,
                value: None,
                tables: BTreeSet::new(),
                deps: BTreeSet::new(),
                dependents: BTreeSet::new(),
                subscribers: 0,
                changed_at: 0,
                verified_at: 0,
                recomputations: 0,
                released_at: Some(Instant::now()),
                notify,
            },
        );
        self.by_key.insert(def.key().clone(), id);
        debug!(node = id.0, label = %def.label(), kind = def.kind().name(), "node created");
        id
    }

    fn link(&mut self, from: NodeId, dep: NodeId) {
        if let Some(node) = self.nodes.get_mut(&from) {
            node.deps.insert(dep);
        }
        if let Some(node) = self.nodes.get_mut(&dep) {
            node.dependents.insert(from);
            node.released_at = None;
        }
    }

    fn unlink_deps(&mut self, id: NodeId) {
        let deps = match self.nodes.get_mut(&id) {
            Some(node) => std::mem::take(&mut node.deps),
            None => return,
        };
        let now = Instant::now();
        for dep in deps {
            if let Some(node) = self.nodes.get_mut(&dep) {
                node.dependents.remove(&id);
                if node.dependents.is_empty() && node.subscribers == 0 {
                    node.released_at.get_or_insert(now);
                }
            }
        }
    }

    fn value_of(&self, id: NodeId) -> Result<Value, RecomputeFailure> {
        match self.nodes.get(&id).and_then(|n| n.value.clone()) {
            Some(value) => value,
            None => Err(RecomputeFailure::new(format!("node {} has no value", id.0))),
        }
    }

    /// Bring a node up to date, recomputing it only if it or an ancestor
    /// actually changed since it was last verified
    fn ensure_fresh(&mut self, id: NodeId) {
        let (state, has_value, deps, verified_at) = match self.nodes.get(&id) {
            Some(n) => (
                n.state,
                n.value.is_some(),
                n.deps.iter().copied().collect::<Vec<_>>(),
                n.verified_at,
            ),
            None => return,
        };

        let must_recompute = match state {
            _ if !has_value => true,
            NodeState::Fresh => false,
            NodeState::Stale => true,
            NodeState::Dirty => {
                let mut changed = false;
                for dep in deps {
                    self.ensure_fresh(dep);
                    let dep_changed = self
                        .nodes
                        .get(&dep)
                        .map(|d| d.changed_at > verified_at)
                        .unwrap_or(true);
                    if dep_changed {
                        changed = true;
                        break;
                    }
                }
                changed
            }
        };

        if must_recompute {
            self.recompute(id);
        } else if let Some(node) = self.nodes.get_mut(&id) {
            node.state = NodeState::Fresh;
            node.verified_at = self.epoch;
        }
    }

    fn recompute(&mut self, id: NodeId) {
        let Some(def) = self.nodes.get(&id).map(|n| n.def.clone()) else {
            return;
        };
        self.unlink_deps(id);
        self.computing.push(id);

        let (result, tables) = match def.kind() {
            DefKind::Query(spec) => (self.run_query(spec), spec.table_set()),
            DefKind::Composed(compose) => {
                let spec = compose(&mut Get {
                    graph: &mut *self,
                    node: id,
                });
                match spec {
                    Ok(spec) => (self.run_query(&spec), spec.table_set()),
                    Err(e) => (Err(e), BTreeSet::new()),
                }
            }
            DefKind::Computed(compute) => {
                let value = compute(&mut Get {
                    graph: &mut *self,
                    node: id,
                });
                (value, BTreeSet::new())
            }
        };
        self.computing.pop();

        let result = match (result, def.map_fn()) {
            (Ok(value), Some(map)) => map(value),
            (other, _) => other,
        }
        .map_err(|e| e.at(def.label()));

        let epoch = self.epoch;
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.value.as_ref() != Some(&result) {
                node.changed_at = epoch;
            }
            node.value = Some(result);
            node.tables = tables;
            node.state = NodeState::Fresh;
            node.verified_at = epoch;
            node.recomputations += 1;
            debug!(node = id.0, label = %def.label(), epoch, "node recomputed");
        }
    }

    fn run_query(&self, spec: &QuerySpec) -> Result<Value, RecomputeFailure> {
        let rows = self.executor.select(&spec.sql, &spec.bind)?;
        Ok(Value::Array(
            rows.into_iter()
                .map(|row| {
                    Value::Object(
                        row.into_iter()
                            .map(|(column, value)| {
                                let value = match spec.columns.get(&column) {
                                    Some(ty) => ty.decode(value),
                                    None => value,
                                };
                                (column, value)
                            })
                            .collect(),
                    )
                })
                .collect(),
        ))
    }

    fn mark_changed(&mut self, hit: Vec<NodeId>) -> usize {
        let mut affected: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        for id in hit {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.state = NodeState::Stale;
                affected.insert(id);
                queue.push_back(id);
            }
        }
        while let Some(id) = queue.pop_front() {
            let dependents: Vec<NodeId> = match self.nodes.get(&id) {
                Some(node) => node.dependents.iter().copied().collect(),
                None => continue,
            };
            for dependent in dependents {
                if !affected.insert(dependent) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(&dependent) {
                    if node.state == NodeState::Fresh {
                        node.state = NodeState::Dirty;
                    }
                }
                queue.push_back(dependent);
            }
        }

        let epoch = self.epoch;
        for id in &affected {
            if let Some(node) = self.nodes.get(id) {
                if node.subscribers > 0 {
                    node.notify.send_replace(epoch);
                }
            }
        }
        affected.len()
    }

    fn collect_garbage(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        loop {
            let expired: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, n)| {
                    n.subscribers == 0
                        && n.dependents.is_empty()
                        && n
                            .released_at
                            .map(|t| now.saturating_duration_since(t) >= self.retention)
                            .unwrap_or(false)
                })
                .map(|(id, _)| *id)
                .collect();
            if expired.is_empty() {
                break;
            }
            for id in expired {
                self.unlink_deps(id);
                if let Some(node) = self.nodes.remove(&id) {
                    self.by_key.remove(&node.key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.nodes.len(), "collected graph nodes");
        }
        removed
    }

    fn transitive_tables(&self, id: NodeId) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(node) = self.nodes.get(&next) {
                tables.extend(node.tables.iter().cloned());
                stack.extend(node.deps.iter().copied());
            }
        }
        tables
    }
}

/// Handle to a subscribed node
#[derive(Debug)]
pub struct Subscription {
    node: NodeId,
    changes: watch::Receiver<u64>,
}

impl Subscription {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Wait until the node is invalidated. Returns false once the node is gone.
    pub async fn changed(&mut self) -> bool {
        self.changes.changed().await.is_ok()
    }

    /// Whether an invalidation arrived since the last `changed`
    pub fn has_changed(&self) -> bool {
        self.changes.has_changed().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub label: String,
    pub kind: &'static str,
    pub state: NodeState,
    /// Tables this node depends on, directly or through its dependencies
    pub tables: BTreeSet<String>,
    pub deps: Vec<NodeId>,
    pub subscribers: usize,
    pub recomputations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub epoch: u64,
    pub nodes: Vec<NodeSnapshot>,
}

impl GraphSnapshot {
    pub fn node(&self, label: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.label == label)
    }
}

/// The reactive node set of one execution context
#[derive(Clone)]
pub struct ReactivityGraph {
    inner: Arc<Mutex<GraphInner>>,
}

impl std::fmt::Debug for ReactivityGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ReactivityGraph")
            .field("nodes", &inner.nodes.len())
            .field("epoch", &inner.epoch)
            .finish()
    }
}

impl ReactivityGraph {
    pub fn new(executor: Arc<dyn QueryExecutor>, retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GraphInner {
                executor,
                nodes: HashMap::new(),
                by_key: HashMap::new(),
                next_id: 1,
                epoch: 0,
                retention,
                computing: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point every query at a different store; all nodes are invalidated
    pub fn set_executor(&self, executor: Arc<dyn QueryExecutor>) {
        let mut inner = self.lock();
        inner.executor = executor;
        drop(inner);
        self.invalidate_all();
    }

    /// Register interest in a definition
    pub fn subscribe(&self, def: &LiveQueryDef) -> Subscription {
        let mut inner = self.lock();
        let id = inner.node_for(def);
        let node = inner.nodes.get_mut(&id);
        let changes = match node {
            Some(node) => {
                node.subscribers += 1;
                node.released_at = None;
                node.notify.subscribe()
            }
            None => watch::channel(0).1,
        };
        Subscription { node: id, changes }
    }

    /// Current value of a subscribed node, recomputing it if needed
    pub fn read(&self, subscription: &Subscription) -> Result<Value, LoamError> {
        let mut inner = self.lock();
        inner.ensure_fresh(subscription.node);
        inner
            .value_of(subscription.node)
            .map_err(LoamError::Recomputation)
    }

    /// One-off read without keeping a subscription
    pub fn query(&self, def: &LiveQueryDef) -> Result<Value, LoamError> {
        let mut inner = self.lock();
        let id = inner.node_for(def);
        inner.ensure_fresh(id);
        inner.value_of(id).map_err(LoamError::Recomputation)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.release(subscription.node);
    }

    /// Drop one subscriber of a node
    pub fn release(&self, node: NodeId) {
        let mut inner = self.lock();
        if let Some(n) = inner.nodes.get_mut(&node) {
            n.subscribers = n.subscribers.saturating_sub(1);
            if n.subscribers == 0 && n.dependents.is_empty() {
                n.released_at = Some(Instant::now());
            }
        }
        inner.collect_garbage(Instant::now());
    }

    /// Invalidate every node reading one of `tables`, and their dependents.
    ///
    /// Returns the number of nodes invalidated.
    pub fn notify_tables_changed(&self, tables: &BTreeSet<String>) -> usize {
        if tables.is_empty() {
            return 0;
        }
        let mut inner = self.lock();
        inner.epoch += 1;
        let hit: Vec<NodeId> = inner
            .nodes
            .iter()
            .filter(|(_, n)| n.value.is_some() && !n.tables.is_disjoint(tables))
            .map(|(id, _)| *id)
            .collect();
        let affected = inner.mark_changed(hit);
        debug!(tables = ?tables, affected, epoch = inner.epoch, "tables changed");
        inner.collect_garbage(Instant::now());
        affected
    }

    pub fn invalidate_all(&self) -> usize {
        let mut inner = self.lock();
        inner.epoch += 1;
        let all: Vec<NodeId> = inner.nodes.keys().copied().collect();
        inner.mark_changed(all)
    }

    /// Remove released nodes whose retention window has passed
    pub fn collect_garbage(&self) -> usize {
        self.lock().collect_garbage(Instant::now())
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn snapshot(&self, include_values: bool) -> GraphSnapshot {
        let inner = self.lock();
        let mut nodes: Vec<NodeSnapshot> = inner
            .nodes
            .iter()
            .map(|(id, n)| {
                let (value, error) = match &n.value {
                    Some(Ok(v)) if include_values => (Some(v.clone()), None),
                    Some(Err(e)) => (None, Some(e.to_string())),
                    _ => (None, None),
                };
                NodeSnapshot {
                    id: *id,
                    label: n.def.label().to_string(),
                    kind: n.def.kind().name(),
                    state: n.state,
                    tables: inner.transitive_tables(*id),
                    deps: n.deps.iter().copied().collect(),
                    subscribers: n.subscribers,
                    recomputations: n.recomputations,
                    value,
                    error,
                }
            })
            .collect();
        nodes.sort_by_key(|n| n.id);
        GraphSnapshot {
            epoch: inner.epoch,
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SharedDb, SqliteDb};
    use serde_json::json;

    fn todos_db() -> SharedDb {
        let mut db = SqliteDb::open_in_memory("graph").unwrap();
        db.execute_batch(
            "CREATE TABLE todos (id TEXT PRIMARY KEY, text TEXT NOT NULL, completed INTEGER NOT NULL);
             CREATE TABLE tags (name TEXT PRIMARY KEY);",
        )
        .unwrap();
        SharedDb::new(db)
    }

    fn graph(db: &SharedDb) -> ReactivityGraph {
        ReactivityGraph::new(Arc::new(db.clone()), Duration::ZERO)
    }

    fn insert(db: &SharedDb, graph: &ReactivityGraph, id: &str, completed: i64) {
        db.lock()
            .execute(
                "INSERT INTO todos VALUES (?, 'x', ?)",
                &json!([id, completed]),
            )
            .unwrap();
        graph.notify_tables_changed(&BTreeSet::from(["todos".to_string()]));
    }

    fn recomputations(graph: &ReactivityGraph, label: &str) -> u64 {
        graph.snapshot(false).node(label).unwrap().recomputations
    }

    #[test]
    fn test_lazy_until_read() {
        let db = todos_db();
        let graph = graph(&db);
        let q = LiveQueryDef::query(QuerySpec::new("select * from todos")).with_label("all");
        let sub = graph.subscribe(&q);
        assert_eq!(recomputations(&graph, "all"), 0);
        assert_eq!(graph.read(&sub).unwrap(), json!([]));
        graph.read(&sub).unwrap();
        assert_eq!(recomputations(&graph, "all"), 1);
    }

    #[test]
    fn test_invalidation_by_table() {
        let db = todos_db();
        let graph = graph(&db);
        let todos = LiveQueryDef::query(QuerySpec::new("select id from todos")).with_label("todos");
        let tags = LiveQueryDef::query(QuerySpec::new("select * from tags")).with_label("tags");
        let todos_sub = graph.subscribe(&todos);
        let tags_sub = graph.subscribe(&tags);
        graph.read(&todos_sub).unwrap();
        graph.read(&tags_sub).unwrap();

        insert(&db, &graph, "t1", 0);

        assert_eq!(graph.read(&todos_sub).unwrap(), json!([{"id": "t1"}]));
        graph.read(&tags_sub).unwrap();
        assert_eq!(recomputations(&graph, "todos"), 2);
        assert_eq!(recomputations(&graph, "tags"), 1);
    }

    #[test]
    fn test_no_read_before_commit_sees_write() {
        let db = todos_db();
        let graph = graph(&db);
        let q = LiveQueryDef::query(QuerySpec::new("select id from todos"));
        let sub = graph.subscribe(&q);
        assert_eq!(graph.read(&sub).unwrap(), json!([]));

        // written but not yet notified: the cached value is still served
        db.lock()
            .execute("INSERT INTO todos VALUES ('t1', 'x', 0)", &Value::Null)
            .unwrap();
        assert_eq!(graph.read(&sub).unwrap(), json!([]));

        graph.notify_tables_changed(&BTreeSet::from(["todos".to_string()]));
        assert_eq!(graph.read(&sub).unwrap(), json!([{"id": "t1"}]));
    }

    #[test]
    fn test_diamond_recomputes_once() {
        let db = todos_db();
        let graph = graph(&db);
        let source = LiveQueryDef::query(QuerySpec::new("select count(*) as n from todos"))
            .with_label("source");
        let left = {
            let source = source.clone();
            LiveQueryDef::computed(move |get| Ok(json!({"left": get.get(&source)?})))
                .with_label("left")
        };
        let right = {
            let source = source.clone();
            LiveQueryDef::computed(move |get| Ok(json!({"right": get.get(&source)?})))
                .with_label("right")
        };
        let joined = {
            let (left, right) = (left.clone(), right.clone());
            LiveQueryDef::computed(move |get| Ok(json!([get.get(&left)?, get.get(&right)?])))
                .with_label("joined")
        };

        let sub = graph.subscribe(&joined);
        graph.read(&sub).unwrap();
        insert(&db, &graph, "t1", 0);
        let value = graph.read(&sub).unwrap();
        assert_eq!(value[0]["left"][0]["n"], 1);

        for label in ["source", "left", "right", "joined"] {
            assert_eq!(recomputations(&graph, label), 2, "{}", label);
        }
    }

    #[test]
    fn test_unchanged_source_keeps_dependents_green() {
        let db = todos_db();
        let graph = graph(&db);
        let done = LiveQueryDef::query(QuerySpec::new(
            "select count(*) as n from todos where completed = 1",
        ))
        .with_label("done");
        let summary = {
            let done = done.clone();
            LiveQueryDef::computed(move |get| Ok(json!({"done": get.get(&done)?})))
                .with_label("summary")
        };
        let sub = graph.subscribe(&summary);
        graph.read(&sub).unwrap();

        insert(&db, &graph, "t1", 0);
        graph.read(&sub).unwrap();

        assert_eq!(recomputations(&graph, "done"), 2);
        assert_eq!(recomputations(&graph, "summary"), 1);
    }

    #[test]
    fn test_composed_query_tracks_filter() {
        let db = todos_db();
        let graph = graph(&db);
        let filter = LiveQueryDef::computed(|_| Ok(json!("where completed = 0")))
            .with_label("where-filter");
        let query = {
            let filter = filter.clone();
            LiveQueryDef::composed(move |get| {
                let clause = get.get(&filter)?;
                Ok(QuerySpec::new(format!(
                    "select id from todos {}",
                    clause.as_str().unwrap_or_default()
                )))
            })
            .with_label("open todos")
        };
        let sub = graph.subscribe(&query);
        assert_eq!(graph.read(&sub).unwrap(), json!([]));

        insert(&db, &graph, "t1", 0);
        insert(&db, &graph, "t2", 1);
        assert_eq!(graph.read(&sub).unwrap(), json!([{"id": "t1"}]));
        assert_eq!(recomputations(&graph, "open todos"), 2);
        assert_eq!(recomputations(&graph, "where-filter"), 1);

        let snapshot = graph.snapshot(true);
        let node = snapshot.node("open todos").unwrap();
        assert!(node.tables.contains("todos"));
        assert_eq!(node.deps.len(), 1);
    }

    #[test]
    fn test_failure_propagates_and_is_not_retried() {
        let db = todos_db();
        let graph = graph(&db);
        let broken = LiveQueryDef::computed(|_| Err("boom".into())).with_label("broken");
        let consumer = {
            let broken = broken.clone();
            LiveQueryDef::computed(move |get| get.get(&broken)).with_label("consumer")
        };
        let healthy = LiveQueryDef::query(QuerySpec::new("select * from todos")).with_label("healthy");

        let sub = graph.subscribe(&consumer);
        let healthy_sub = graph.subscribe(&healthy);
        let err = graph.read(&sub).unwrap_err();
        match err {
            LoamError::Recomputation(failure) => {
                assert_eq!(failure.node.as_deref(), Some("broken"));
                assert_eq!(failure.message, "boom");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(graph.read(&sub).is_err());
        assert_eq!(recomputations(&graph, "broken"), 1);
        assert!(graph.read(&healthy_sub).is_ok());
    }

    #[test]
    fn test_query_error_is_node_failure() {
        let db = todos_db();
        let graph = graph(&db);
        let bad = LiveQueryDef::query(QuerySpec::new("select * from missing"));
        assert!(matches!(graph.query(&bad), Err(LoamError::Recomputation(_))));
    }

    #[test]
    fn test_writing_query_fails_without_touching_store() {
        let db = todos_db();
        let graph = graph(&db);
        insert(&db, &graph, "t1", 0);

        let delete = LiveQueryDef::query(QuerySpec::new("DELETE FROM todos"));
        assert!(matches!(graph.query(&delete), Err(LoamError::Recomputation(_))));
        let count = db
            .lock()
            .select_value("SELECT count(*) FROM todos", &Value::Null)
            .unwrap();
        assert_eq!(count, Some(json!(1)));
    }

    #[test]
    fn test_comma_join_invalidated_by_either_table() {
        let db = todos_db();
        let graph = graph(&db);
        let pairs = LiveQueryDef::query(QuerySpec::new("SELECT count(*) AS n FROM todos, tags"))
            .with_label("pairs");
        let sub = graph.subscribe(&pairs);
        insert(&db, &graph, "t1", 0);
        assert_eq!(graph.read(&sub).unwrap(), json!([{"n": 0}]));

        db.lock()
            .execute("INSERT INTO tags VALUES ('home')", &Value::Null)
            .unwrap();
        graph.notify_tables_changed(&BTreeSet::from(["tags".to_string()]));
        assert_eq!(graph.read(&sub).unwrap(), json!([{"n": 1}]));
        assert_eq!(recomputations(&graph, "pairs"), 2);
    }

    #[test]
    fn test_cycle_is_reported() {
        let db = todos_db();
        let graph = graph(&db);
        let slot: Arc<Mutex<Option<LiveQueryDef>>> = Arc::new(Mutex::new(None));
        let a = {
            let slot = slot.clone();
            LiveQueryDef::computed(move |get| {
                let b = slot.lock().unwrap().clone().unwrap();
                get.get(&b)
            })
        };
        let b = {
            let a = a.clone();
            LiveQueryDef::computed(move |get| get.get(&a))
        };
        *slot.lock().unwrap() = Some(b);
        let err = graph.query(&a).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_equal_definitions_share_node() {
        let db = todos_db();
        let graph = graph(&db);
        let a = graph.subscribe(&LiveQueryDef::query(QuerySpec::new("select * from todos")));
        let b = graph.subscribe(&LiveQueryDef::query(QuerySpec::new("select * from todos")));
        assert_eq!(a.node(), b.node());
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.snapshot(false).nodes[0].subscribers, 2);
    }

    #[test]
    fn test_unsubscribe_collects_unused_nodes() {
        let db = todos_db();
        let graph = graph(&db);
        let source = LiveQueryDef::query(QuerySpec::new("select * from todos"));
        let derived = {
            let source = source.clone();
            LiveQueryDef::computed(move |get| get.get(&source))
        };
        let sub = graph.subscribe(&derived);
        graph.read(&sub).unwrap();
        assert_eq!(graph.node_count(), 2);

        graph.unsubscribe(sub);
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_retention_keeps_nodes_for_reuse() {
        let db = todos_db();
        let graph = ReactivityGraph::new(Arc::new(db.clone()), Duration::from_secs(60));
        let q = LiveQueryDef::query(QuerySpec::new("select * from todos")).with_label("q");
        let sub = graph.subscribe(&q);
        graph.read(&sub).unwrap();
        graph.unsubscribe(sub);
        assert_eq!(graph.collect_garbage(), 0);

        let again = graph.subscribe(&q);
        graph.read(&again).unwrap();
        assert_eq!(recomputations(&graph, "q"), 1);
    }

    #[test]
    fn test_column_hints_decode_rows() {
        let db = todos_db();
        let graph = graph(&db);
        db.lock()
            .execute("INSERT INTO todos VALUES ('t1', 'buy milk', 0)", &Value::Null)
            .unwrap();
        let spec = QuerySpec::new("select * from todos").columns(
            [("completed".to_string(), crate::schema::ColumnType::Boolean)]
                .into_iter()
                .collect(),
        );
        let rows = graph.query(&LiveQueryDef::query(spec)).unwrap();
        assert_eq!(rows, json!([{"id": "t1", "text": "buy milk", "completed": false}]));
    }

    #[test]
    fn test_first_or_fallback() {
        let db = todos_db();
        let graph = graph(&db);
        let first = LiveQueryDef::query(QuerySpec::new("select id from todos"))
            .first_or(json!({"id": ""}));
        assert_eq!(graph.query(&first).unwrap(), json!({"id": ""}));
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let db = todos_db();
        let graph = graph(&db);
        let q = LiveQueryDef::query(QuerySpec::new("select * from todos"));
        let mut sub = graph.subscribe(&q);
        graph.read(&sub).unwrap();
        assert!(!sub.has_changed());

        insert(&db, &graph, "t1", 0);
        assert!(sub.has_changed());
        assert!(sub.changed().await);
        assert_eq!(graph.read(&sub).unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_set_executor_invalidates_everything() {
        let db = todos_db();
        let graph = graph(&db);
        let q = LiveQueryDef::query(QuerySpec::new("select id from todos")).with_label("q");
        let sub = graph.subscribe(&q);
        graph.read(&sub).unwrap();

        let other = todos_db();
        other
            .lock()
            .execute("INSERT INTO todos VALUES ('t9', 'x', 0)", &Value::Null)
            .unwrap();
        graph.set_executor(Arc::new(other));
        assert_eq!(graph.read(&sub).unwrap(), json!([{"id": "t9"}]));
    }
}
