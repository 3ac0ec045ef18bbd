//! Shared, immutable node declarations.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::GraphError;
use crate::graph::Graph;
use crate::state::Value;

/// The two node kinds of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// An externally written leaf value; never computed.
    Source,
    /// A value computed from other nodes, cached until an input changes.
    Derived,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Source => f.write_str("source"),
            NodeKind::Derived => f.write_str("derived"),
        }
    }
}

/// Compute function of a derived node.
///
/// The closure receives the evaluating [`Graph`] — reads made through it
/// are attributed to the node as dependencies — and the call arguments
/// passed to [`Graph::evaluate_with`].
pub type ComputeFn = Arc<dyn Fn(&Graph, &[Value]) -> Result<Value, GraphError> + Send + Sync>;

/// Immutable definition of one node: its stable name, kind, and (for
/// derived nodes) the compute function.
///
/// Descriptors are created once, when the schema is defined, and shared
/// read-only by every instance of that schema — the analogue of a field
/// declaration. All mutable state (cache, validity, edges) lives in the
/// per-instance [`Graph`].
pub struct NodeDescriptor {
    name: String,
    kind: NodeKind,
    compute: Option<ComputeFn>,
}

impl NodeDescriptor {
    /// The node's name, unique within its schema.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is a source or a derived node.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The compute function; `Some` exactly for derived nodes.
    pub(crate) fn compute(&self) -> Option<&ComputeFn> {
        self.compute.as_ref()
    }
}

impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// An immutable set of node declarations for one model type.
///
/// Cheap to clone — all declarations are shared behind `Arc`. Any number of
/// [`Graph`] instances can be created from one schema; they share the
/// declarations but never any cached state.
#[derive(Clone)]
pub struct Schema {
    descriptors: Arc<IndexMap<String, Arc<NodeDescriptor>>>,
}

impl Schema {
    /// Start declaring a new schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Look up a descriptor by node name.
    pub fn descriptor(&self, name: &str) -> Option<&Arc<NodeDescriptor>> {
        self.descriptors.get(name)
    }

    /// Node names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    /// Descriptors in declaration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<NodeDescriptor>> {
        self.descriptors.values()
    }

    /// Number of declared nodes.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns `true` if no nodes are declared.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.descriptors.values()).finish()
    }
}

/// Builder for [`Schema`].
///
/// # Example
///
/// ```
/// use memograph::{Schema, Value};
///
/// let schema = Schema::builder()
///     .source("base")
///     .derived("doubled", |g, _| Ok(Value::new(*g.read_as::<i64>("base")? * 2)))
///     .build()?;
/// assert_eq!(schema.len(), 2);
/// # Ok::<(), memograph::GraphError>(())
/// ```
#[derive(Default)]
pub struct SchemaBuilder {
    descriptors: Vec<NodeDescriptor>,
}

impl SchemaBuilder {
    /// Declare a source node: an externally written leaf.
    ///
    /// Reading it before the first write fails with
    /// [`GraphError::UnsetValue`].
    pub fn source(mut self, name: impl Into<String>) -> Self {
        self.descriptors.push(NodeDescriptor {
            name: name.into(),
            kind: NodeKind::Source,
            compute: None,
        });
        self
    }

    /// Declare a derived node computed by `compute`.
    ///
    /// Nodes read through the closure's [`Graph`] argument become this
    /// node's dependencies for as long as the computed value is cached.
    pub fn derived<F>(mut self, name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&Graph, &[Value]) -> Result<Value, GraphError> + Send + Sync + 'static,
    {
        self.descriptors.push(NodeDescriptor {
            name: name.into(),
            kind: NodeKind::Derived,
            compute: Some(Arc::new(compute)),
        });
        self
    }

    /// Finish the schema.
    ///
    /// # Errors
    ///
    /// [`GraphError::DuplicateNode`] if a name was declared twice.
    pub fn build(self) -> Result<Schema, GraphError> {
        let mut descriptors = IndexMap::with_capacity(self.descriptors.len());
        for descriptor in self.descriptors {
            let name = descriptor.name().to_owned();
            if descriptors.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(GraphError::DuplicateNode { node: name });
            }
        }
        Ok(Schema {
            descriptors: Arc::new(descriptors),
        })
    }
}
