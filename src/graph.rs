//! The per-instance graph context: read, write, and evaluate operations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, trace};

use crate::error::GraphError;
use crate::invalidate::invalidate_from;
use crate::schema::{NodeDescriptor, NodeKind, Schema};
use crate::state::{NodeRef, NodeState, Value};
use crate::watch::WatchStack;

/// Mutable graph state of one instance: the node table and the watch stack.
#[derive(Default)]
struct GraphInner {
    nodes: Slab<NodeState>,
    index: HashMap<String, usize>,
    watch: WatchStack,
}

impl GraphInner {
    /// Slab index for `name`, creating the state lazily on first touch.
    fn index_of(&mut self, name: &str) -> usize {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        let index = self.nodes.insert(NodeState::new(name));
        self.index.insert(name.to_owned(), index);
        index
    }

    /// Record `index` as a dependency of the active watch frame, if any.
    ///
    /// Duplicate edges collapse, and a node never becomes its own
    /// dependency. Top-level reads (no active frame) record nothing.
    fn record_read(&mut self, index: usize) {
        let Some(watcher) = self.watch.active() else {
            return;
        };
        if watcher == index {
            return;
        }
        let parents = &mut self.nodes[watcher].parents;
        if !parents.contains(&index) {
            parents.push(index);
        }
        let children = &mut self.nodes[index].children;
        if !children.contains(&watcher) {
            children.push(watcher);
        }
    }

    /// Drop `index`'s outgoing dependency edges, in both directions.
    ///
    /// Called before re-evaluation so the dependency set is rebuilt from
    /// the reads that actually occur in that run.
    fn clear_dependencies(&mut self, index: usize) {
        let parents = std::mem::take(&mut self.nodes[index].parents);
        for parent in parents {
            self.nodes[parent].children.retain(|&child| child != index);
        }
    }

    fn names(&self, indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| self.nodes[i].name.clone()).collect()
    }
}

/// A reactive computation graph bound to one model instance.
///
/// A `Graph` owns all per-instance node state (cached values, validity
/// flags, dependency edges) for one instance of a [`Schema`]. Reading a
/// node during another node's evaluation records a dependency edge; writing
/// a source node invalidates its downstream closure; invalidated derived
/// nodes recompute lazily on their next read.
///
/// # Example
///
/// ```
/// use memograph::{Graph, Schema, Value};
///
/// let schema = Schema::builder()
///     .source("x")
///     .source("y")
///     .derived("sum", |g, _| {
///         Ok(Value::new(*g.read_as::<i64>("x")? + *g.read_as::<i64>("y")?))
///     })
///     .build()?;
///
/// let graph = Graph::new(schema);
/// graph.write("x", 1_i64)?;
/// graph.write("y", 2_i64)?;
/// assert_eq!(*graph.read_as::<i64>("sum")?, 3);
/// # Ok::<(), memograph::GraphError>(())
/// ```
pub struct Graph {
    schema: Schema,
    inner: Mutex<GraphInner>,
}

/// RAII guard for one watch-stack frame; pops on every exit path,
/// including compute failures.
struct WatchFrame<'g> {
    graph: &'g Graph,
}

impl Drop for WatchFrame<'_> {
    fn drop(&mut self) {
        self.graph.inner.lock().watch.pop();
    }
}

impl Graph {
    /// Create a fresh instance of `schema` with no cached state.
    pub fn new(schema: Schema) -> Self {
        Graph {
            schema,
            inner: Mutex::new(GraphInner::default()),
        }
    }

    /// The shared schema this instance was created from.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn descriptor(&self, name: &str) -> Result<&Arc<NodeDescriptor>, GraphError> {
        self.schema
            .descriptor(name)
            .ok_or_else(|| GraphError::UnboundNode {
                node: name.to_owned(),
            })
    }

    /// Read a node's value.
    ///
    /// If a node is currently being evaluated, the read is recorded as a
    /// dependency of that node. Source nodes return their cached value or
    /// fail with [`GraphError::UnsetValue`]; derived nodes are evaluated
    /// with no call arguments.
    pub fn read(&self, name: &str) -> Result<Value, GraphError> {
        match self.descriptor(name)?.kind() {
            NodeKind::Source => self.read_source(name),
            NodeKind::Derived => self.evaluate_with(name, &[]),
        }
    }

    fn read_source(&self, name: &str) -> Result<Value, GraphError> {
        let mut inner = self.inner.lock();
        let index = inner.index_of(name);
        inner.record_read(index);
        match inner.nodes[index].cached() {
            Some(value) => {
                trace!(node = name, "source read");
                Ok(value)
            }
            None => Err(GraphError::UnsetValue {
                node: name.to_owned(),
            }),
        }
    }

    /// Read a node's value and downcast it to `T`.
    ///
    /// # Errors
    ///
    /// Everything [`read`](Graph::read) can raise, plus
    /// [`GraphError::TypeMismatch`] if the value is of a different type.
    pub fn read_as<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, GraphError> {
        self.read(name)?
            .downcast::<T>()
            .ok_or_else(|| GraphError::TypeMismatch {
                node: name.to_owned(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Write a source node and invalidate its downstream closure.
    ///
    /// The written node becomes valid with the new value; every transitive
    /// dependent is marked invalid and recomputes on its next read. Cost is
    /// proportional to the size of the affected subgraph.
    ///
    /// # Errors
    ///
    /// [`GraphError::KindMismatch`] for derived nodes,
    /// [`GraphError::UnboundNode`] for undeclared names.
    pub fn write<T: Send + Sync + 'static>(&self, name: &str, value: T) -> Result<(), GraphError> {
        if self.descriptor(name)?.kind() != NodeKind::Source {
            return Err(GraphError::KindMismatch {
                node: name.to_owned(),
                expected: NodeKind::Source,
            });
        }
        let mut inner = self.inner.lock();
        let index = inner.index_of(name);
        let children = {
            let node = &mut inner.nodes[index];
            node.value = Some(Value::new(value));
            node.valid = true;
            node.children.clone()
        };
        for child in children {
            invalidate_from(&mut inner.nodes, child);
        }
        debug!(node = name, "write");
        Ok(())
    }

    /// Evaluate a derived node with no call arguments.
    ///
    /// See [`evaluate_with`](Graph::evaluate_with).
    pub fn evaluate(&self, name: &str) -> Result<Value, GraphError> {
        self.evaluate_with(name, &[])
    }

    /// Evaluate a derived node, passing `args` to its compute function.
    ///
    /// If the node is valid, the cached value is returned without running
    /// the compute function. Otherwise the node's dependency set is cleared
    /// and rebuilt from the reads that occur during the run, the result is
    /// cached, and the node becomes valid. A failing compute function
    /// leaves the node invalid (the next read retries) with the watch stack
    /// correctly unwound.
    ///
    /// The cache is **not** keyed by `args`: while the node is valid, a
    /// call with different arguments returns the value computed for the
    /// previous call's arguments. This is a deliberate design choice, not
    /// an oversight; argument sensitivity requires an argument-keyed cache.
    ///
    /// # Errors
    ///
    /// [`GraphError::KindMismatch`] for source nodes,
    /// [`GraphError::UnboundNode`] for undeclared names,
    /// [`GraphError::Cycle`] if the node is already being evaluated, and
    /// whatever the compute function raises.
    pub fn evaluate_with(&self, name: &str, args: &[Value]) -> Result<Value, GraphError> {
        let descriptor = self.descriptor(name)?;
        let Some(compute) = descriptor.compute() else {
            return Err(GraphError::KindMismatch {
                node: name.to_owned(),
                expected: NodeKind::Derived,
            });
        };
        let compute = Arc::clone(compute);

        {
            let mut inner = self.inner.lock();
            let index = inner.index_of(name);
            inner.record_read(index);
            if let Some(value) = inner.nodes[index].cached() {
                trace!(node = name, "cache hit");
                return Ok(value);
            }
            if inner.watch.contains(index) {
                let mut path = inner.names(inner.watch.frames());
                path.push(name.to_owned());
                return Err(GraphError::Cycle { path });
            }
            inner.clear_dependencies(index);
            inner.watch.push(index);
        }

        trace!(node = name, "recomputing");
        let result = {
            // The frame pops on drop, so the stack unwinds on the error
            // path as well. The lock is not held while compute runs, which
            // keeps nested evaluation reentrant.
            let _frame = WatchFrame { graph: self };
            (compute)(self, args)
        };

        let mut inner = self.inner.lock();
        let index = inner.index_of(name);
        let node = &mut inner.nodes[index];
        match result {
            Ok(value) => {
                node.value = Some(value.clone());
                node.valid = true;
                Ok(value)
            }
            Err(err) => {
                node.value = None;
                node.valid = false;
                Err(err)
            }
        }
    }

    /// Manually invalidate `name` and its dependents-closure.
    ///
    /// Derived nodes recompute on their next read; an invalidated source
    /// node reverts to unset and must be written again before it can be
    /// read.
    pub fn invalidate(&self, name: &str) -> Result<(), GraphError> {
        self.descriptor(name)?;
        let mut inner = self.inner.lock();
        let index = inner.index_of(name);
        debug!(node = name, "invalidate");
        invalidate_from(&mut inner.nodes, index);
        Ok(())
    }

    /// Current cached value of `name`, if any.
    ///
    /// Unlike [`read`](Graph::read), this records no dependency edge and
    /// never triggers computation. Returns `None` for unset, invalid, or
    /// never-touched nodes.
    pub fn peek(&self, name: &str) -> Option<Value> {
        let inner = self.inner.lock();
        let index = *inner.index.get(name)?;
        inner.nodes[index].cached()
    }

    /// Whether `name` currently holds an up-to-date value.
    ///
    /// Never-touched and undeclared names report `false`. No side effects.
    pub fn is_valid(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        match inner.index.get(name) {
            Some(&index) => inner.nodes[index].valid,
            None => false,
        }
    }

    /// Introspection snapshot of one node: descriptor plus per-instance
    /// state, without reading its value.
    pub fn node(&self, name: &str) -> Result<NodeRef, GraphError> {
        let descriptor = self.descriptor(name)?;
        let inner = self.inner.lock();
        Ok(Self::snapshot(&inner, descriptor))
    }

    /// Snapshots of every declared node, in declaration order.
    pub fn nodes(&self) -> Vec<NodeRef> {
        let inner = self.inner.lock();
        self.schema
            .descriptors()
            .map(|descriptor| Self::snapshot(&inner, descriptor))
            .collect()
    }

    fn snapshot(inner: &GraphInner, descriptor: &Arc<NodeDescriptor>) -> NodeRef {
        match inner.index.get(descriptor.name()) {
            Some(&index) => {
                let node = &inner.nodes[index];
                NodeRef::new(
                    Arc::clone(descriptor),
                    node.valid,
                    node.value.is_some(),
                    inner.names(&node.parents),
                    inner.names(&node.children),
                )
            }
            None => NodeRef::new(Arc::clone(descriptor), false, false, Vec::new(), Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Graph>();
        assert_sync::<Graph>();
    }

    fn chain_schema() -> Schema {
        // a (source), b = a * 2, c = b + 1
        Schema::builder()
            .source("a")
            .derived("b", |g, _| Ok(Value::new(*g.read_as::<i64>("a")? * 2)))
            .derived("c", |g, _| Ok(Value::new(*g.read_as::<i64>("b")? + 1)))
            .build()
            .unwrap()
    }

    #[test]
    fn chain_recomputes_after_write() {
        let graph = Graph::new(chain_schema());

        graph.write("a", 3_i64).unwrap();
        assert_eq!(*graph.read_as::<i64>("c").unwrap(), 7);
        assert_eq!(*graph.peek("b").unwrap().downcast::<i64>().unwrap(), 6);

        graph.write("a", 5_i64).unwrap();
        assert!(!graph.is_valid("b"));
        assert!(!graph.is_valid("c"));

        assert_eq!(*graph.read_as::<i64>("c").unwrap(), 11);
        assert_eq!(*graph.peek("b").unwrap().downcast::<i64>().unwrap(), 10);
    }

    #[test]
    fn valid_nodes_do_not_recompute() {
        static RUNS: AtomicU32 = AtomicU32::new(0);

        let schema = Schema::builder()
            .source("x")
            .source("y")
            .derived("sum", |g, _| {
                RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(Value::new(
                    *g.read_as::<i64>("x")? + *g.read_as::<i64>("y")?,
                ))
            })
            .build()
            .unwrap();
        let graph = Graph::new(schema);

        // Each write invalidates `sum` only if it was already computed.
        graph.write("x", 1_i64).unwrap();
        graph.write("y", 2_i64).unwrap();

        assert_eq!(*graph.read_as::<i64>("sum").unwrap(), 3);
        assert_eq!(*graph.read_as::<i64>("sum").unwrap(), 3);
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unset_source_read_fails() {
        let graph = Graph::new(chain_schema());
        let err = graph.read("a").unwrap_err();
        assert!(matches!(err, GraphError::UnsetValue { node } if node == "a"));

        // The same error propagates out of a dependent evaluation.
        let err = graph.evaluate("b").unwrap_err();
        assert!(matches!(err, GraphError::UnsetValue { node } if node == "a"));
    }

    #[test]
    fn unknown_names_are_unbound() {
        let graph = Graph::new(chain_schema());
        assert!(matches!(
            graph.read("nope"),
            Err(GraphError::UnboundNode { node }) if node == "nope"
        ));
        assert!(matches!(
            graph.write("nope", 1_i64),
            Err(GraphError::UnboundNode { .. })
        ));
        assert!(matches!(graph.node("nope"), Err(GraphError::UnboundNode { .. })));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let graph = Graph::new(chain_schema());
        assert!(matches!(
            graph.write("b", 1_i64),
            Err(GraphError::KindMismatch { node, expected: NodeKind::Source }) if node == "b"
        ));
        assert!(matches!(
            graph.evaluate("a"),
            Err(GraphError::KindMismatch { node, expected: NodeKind::Derived }) if node == "a"
        ));
    }

    #[test]
    fn typed_read_checks_the_type() {
        let graph = Graph::new(chain_schema());
        graph.write("a", 3_i64).unwrap();
        assert!(matches!(
            graph.read_as::<String>("a"),
            Err(GraphError::TypeMismatch { node, .. }) if node == "a"
        ));
    }

    #[test]
    fn cycles_fail_fast() {
        let schema = Schema::builder()
            .derived("ping", |g, _| g.evaluate("pong"))
            .derived("pong", |g, _| g.evaluate("ping"))
            .build()
            .unwrap();
        let graph = Graph::new(schema);

        let err = graph.evaluate("ping").unwrap_err();
        let GraphError::Cycle { path } = err else {
            panic!("expected cycle error, got {err:?}");
        };
        assert_eq!(path, ["ping", "pong", "ping"]);
    }

    #[test]
    fn self_cycle_fails_fast() {
        let schema = Schema::builder()
            .derived("selfish", |g, _| g.evaluate("selfish"))
            .build()
            .unwrap();
        let graph = Graph::new(schema);
        assert!(matches!(
            graph.evaluate("selfish"),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn failed_compute_retries_on_next_read() {
        static RUNS: AtomicU32 = AtomicU32::new(0);

        let schema = Schema::builder()
            .source("ready")
            .derived("gated", |g, _| {
                RUNS.fetch_add(1, Ordering::SeqCst);
                if *g.read_as::<bool>("ready")? {
                    Ok(Value::new("done"))
                } else {
                    Err(anyhow::anyhow!("not ready").into())
                }
            })
            .build()
            .unwrap();
        let graph = Graph::new(schema);

        graph.write("ready", false).unwrap();
        let err = graph.evaluate("gated").unwrap_err();
        assert!(matches!(err, GraphError::Compute(_)));
        assert!(!graph.is_valid("gated"));

        // The watch stack unwound; the node retries and can succeed.
        graph.write("ready", true).unwrap();
        assert_eq!(*graph.read_as::<&str>("gated").unwrap(), "done");
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_in_nested_evaluation_unwinds_both_frames() {
        let schema = Schema::builder()
            .source("a")
            .derived("mid", |g, _| g.read("a"))
            .derived("top", |g, _| g.evaluate("mid"))
            .build()
            .unwrap();
        let graph = Graph::new(schema);

        // `a` unset: the failure surfaces through two watch frames.
        assert!(graph.evaluate("top").is_err());
        assert!(!graph.is_valid("mid"));
        assert!(!graph.is_valid("top"));

        // Both frames were popped; a later top-level evaluation works.
        graph.write("a", 9_i64).unwrap();
        assert_eq!(*graph.read_as::<i64>("top").unwrap(), 9);
    }

    #[test]
    fn cache_is_not_keyed_by_args() {
        let schema = Schema::builder()
            .source("scale")
            .derived("scaled", |g, args| {
                let factor = args
                    .first()
                    .and_then(|v| v.downcast::<i64>())
                    .map_or(1, |v| *v);
                Ok(Value::new(*g.read_as::<i64>("scale")? * factor))
            })
            .build()
            .unwrap();
        let graph = Graph::new(schema);
        graph.write("scale", 10_i64).unwrap();

        let first = graph.evaluate_with("scaled", &[Value::new(2_i64)]).unwrap();
        assert_eq!(*first.downcast::<i64>().unwrap(), 20);

        // Still valid: the previous call's value is returned as-is.
        let second = graph.evaluate_with("scaled", &[Value::new(3_i64)]).unwrap();
        assert_eq!(*second.downcast::<i64>().unwrap(), 20);

        // After invalidation the new arguments take effect.
        graph.invalidate("scaled").unwrap();
        let third = graph.evaluate_with("scaled", &[Value::new(3_i64)]).unwrap();
        assert_eq!(*third.downcast::<i64>().unwrap(), 30);
    }

    #[test]
    fn manual_invalidation_forces_recompute() {
        static RUNS: AtomicU32 = AtomicU32::new(0);

        let schema = Schema::builder()
            .source("a")
            .derived("b", |g, _| {
                RUNS.fetch_add(1, Ordering::SeqCst);
                g.read("a")
            })
            .build()
            .unwrap();
        let graph = Graph::new(schema);
        graph.write("a", 1_i64).unwrap();

        graph.read("b").unwrap();
        graph.read("b").unwrap();
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);

        graph.invalidate("b").unwrap();
        graph.read("b").unwrap();
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidated_source_reverts_to_unset() {
        let graph = Graph::new(chain_schema());
        graph.write("a", 1_i64).unwrap();
        graph.read("c").unwrap();

        graph.invalidate("a").unwrap();
        assert!(matches!(
            graph.read("a"),
            Err(GraphError::UnsetValue { .. })
        ));
        assert!(!graph.is_valid("c"));
    }

    #[test]
    fn introspection_reports_edges_by_name() {
        let graph = Graph::new(chain_schema());
        graph.write("a", 3_i64).unwrap();
        graph.read("c").unwrap();

        let b = graph.node("b").unwrap();
        assert_eq!(b.kind(), NodeKind::Derived);
        assert!(b.is_valid());
        assert_eq!(b.parents(), ["a"]);
        assert_eq!(b.children(), ["c"]);

        let a = graph.node("a").unwrap();
        assert_eq!(a.kind(), NodeKind::Source);
        assert!(a.parents().is_empty());
        assert_eq!(a.children(), ["b"]);

        let all = graph.nodes();
        let names: Vec<_> = all.iter().map(NodeRef::name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn top_level_reads_record_no_edges() {
        let graph = Graph::new(chain_schema());
        graph.write("a", 3_i64).unwrap();
        graph.read("a").unwrap();
        graph.read("a").unwrap();

        let a = graph.node("a").unwrap();
        assert!(a.children().is_empty());
    }

    #[test]
    fn duplicate_reads_collapse_to_one_edge() {
        let schema = Schema::builder()
            .source("x")
            .derived("twice", |g, _| {
                let first = *g.read_as::<i64>("x")?;
                let second = *g.read_as::<i64>("x")?;
                Ok(Value::new(first + second))
            })
            .build()
            .unwrap();
        let graph = Graph::new(schema);
        graph.write("x", 4_i64).unwrap();
        graph.read("twice").unwrap();

        let twice = graph.node("twice").unwrap();
        assert_eq!(twice.parents(), ["x"]);
        assert_eq!(graph.node("x").unwrap().children(), ["twice"]);
    }

    #[test]
    fn instances_share_a_schema_but_no_state() {
        let schema = chain_schema();
        let first = Graph::new(schema.clone());
        let second = Graph::new(schema);

        first.write("a", 1_i64).unwrap();
        first.read("c").unwrap();

        assert!(first.is_valid("c"));
        assert!(!second.is_valid("c"));
        assert!(matches!(
            second.read("a"),
            Err(GraphError::UnsetValue { .. })
        ));
        assert!(second.node("b").unwrap().parents().is_empty());
    }

    #[test]
    fn peek_never_computes() {
        static RUNS: AtomicU32 = AtomicU32::new(0);

        let schema = Schema::builder()
            .source("a")
            .derived("b", |g, _| {
                RUNS.fetch_add(1, Ordering::SeqCst);
                g.read("a")
            })
            .build()
            .unwrap();
        let graph = Graph::new(schema);
        graph.write("a", 1_i64).unwrap();

        assert!(graph.peek("b").is_none());
        assert_eq!(RUNS.load(Ordering::SeqCst), 0);

        graph.read("b").unwrap();
        assert!(graph.peek("b").is_some());
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }
}
