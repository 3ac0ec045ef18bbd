//! Per-instance node state and the type-erased value cell.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::schema::{NodeDescriptor, NodeKind};

/// A type-erased cached value.
///
/// Values are cheap to clone — the payload is shared behind `Arc`. Use
/// [`Value::downcast`] (or [`Graph::read_as`](crate::Graph::read_as)) to
/// get the concrete type back out.
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wrap a value for storage in the graph.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Value(Arc::new(value))
    }

    /// Downcast to the concrete type the value was stored as.
    ///
    /// Returns `None` if the stored type is not `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Value(..)")
    }
}

/// Mutable, per-instance state of one node.
///
/// One of these exists per (graph instance, node name) pair, created lazily
/// the first time the instance touches the node. Edges are stored as slab
/// indices into the owning instance's node table; they never leak between
/// instances.
pub(crate) struct NodeState {
    /// Node name, for error messages and introspection snapshots.
    pub(crate) name: String,
    /// Cached value; meaningful only while `valid`.
    pub(crate) value: Option<Value>,
    /// Whether `value` reflects the latest values of all dependencies.
    pub(crate) valid: bool,
    /// Nodes this node read during its most recent evaluation.
    pub(crate) parents: Vec<usize>,
    /// Nodes whose most recent evaluation read this node.
    pub(crate) children: Vec<usize>,
}

impl NodeState {
    pub(crate) fn new(name: &str) -> Self {
        NodeState {
            name: name.to_owned(),
            value: None,
            valid: false,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    /// The cached value, present only while the node is valid.
    pub(crate) fn cached(&self) -> Option<Value> {
        if self.valid {
            self.value.clone()
        } else {
            None
        }
    }
}

/// Introspection snapshot of one node: its shared descriptor plus the
/// per-instance cache and edge state at the time of the call.
///
/// Snapshots are produced by [`Graph::node`](crate::Graph::node) and
/// [`Graph::nodes`](crate::Graph::nodes). Taking one is distinct from
/// reading the node's value: it records no dependency edges and never
/// triggers computation.
#[derive(Debug, Clone)]
pub struct NodeRef {
    descriptor: Arc<NodeDescriptor>,
    valid: bool,
    has_value: bool,
    parents: Vec<String>,
    children: Vec<String>,
}

impl NodeRef {
    pub(crate) fn new(
        descriptor: Arc<NodeDescriptor>,
        valid: bool,
        has_value: bool,
        parents: Vec<String>,
        children: Vec<String>,
    ) -> Self {
        NodeRef {
            descriptor,
            valid,
            has_value,
            parents,
            children,
        }
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        self.descriptor.kind()
    }

    /// The shared descriptor this node was declared with.
    pub fn descriptor(&self) -> &Arc<NodeDescriptor> {
        &self.descriptor
    }

    /// Whether the cached value was up to date when the snapshot was taken.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether a cached value was present when the snapshot was taken.
    pub fn has_value(&self) -> bool {
        self.has_value
    }

    /// Names of the nodes this node read during its most recent evaluation.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    /// Names of the nodes whose most recent evaluation read this node.
    pub fn children(&self) -> &[String] {
        &self.children
    }
}
