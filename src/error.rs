//! Error types for graph operations.

use std::sync::Arc;

use crate::schema::NodeKind;

/// Errors raised by graph operations.
///
/// Every error is terminal for the triggering operation — nothing in the
/// core retries — and names the offending node in its message. Compute
/// failures can be propagated out of compute functions with the `?`
/// operator via the `From<anyhow::Error>` conversion.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// A source node was read before its first write.
    #[error("the value at node `{node}` has not been set")]
    UnsetValue {
        /// Name of the unset source node.
        node: String,
    },

    /// An operation referred to a node the schema never declared.
    #[error("node `{node}` is not declared in the schema")]
    UnboundNode {
        /// The unknown node name.
        node: String,
    },

    /// A node was evaluated while its own evaluation was already in
    /// progress.
    ///
    /// The `path` lists the evaluation chain, ending with the node that
    /// closed the cycle.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Names of the nodes forming the cycle.
        path: Vec<String>,
    },

    /// The operation is not supported by the node's kind, such as writing
    /// a derived node or evaluating a source node.
    #[error("node `{node}` is not a {expected} node")]
    KindMismatch {
        /// Name of the node.
        node: String,
        /// The kind the operation requires.
        expected: NodeKind,
    },

    /// A schema declared the same node name twice.
    #[error("node `{node}` is declared more than once in the schema")]
    DuplicateNode {
        /// The repeated node name.
        node: String,
    },

    /// A typed read found a cached value of a different type.
    #[error("the value at node `{node}` is not of type {expected}")]
    TypeMismatch {
        /// Name of the node.
        node: String,
        /// Name of the requested type.
        expected: &'static str,
    },

    /// A compute function failed.
    ///
    /// The failing node is left invalid with no cached value, so the next
    /// read retries the computation.
    #[error("compute failed: {0}")]
    Compute(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for GraphError {
    fn from(err: anyhow::Error) -> Self {
        GraphError::Compute(Arc::new(err))
    }
}

impl GraphError {
    /// Returns the inner error if this is a `Compute` variant.
    pub fn compute_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            GraphError::Compute(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the compute error to a specific type.
    ///
    /// Returns `Some(&E)` if this is a `Compute` error containing an error
    /// of type `E`, otherwise `None`.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.compute_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `Compute` error containing an error of
    /// type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_node() {
        let err = GraphError::UnsetValue {
            node: "alpha".to_string(),
        };
        assert_eq!(err.to_string(), "the value at node `alpha` has not been set");

        let err = GraphError::KindMismatch {
            node: "weight".to_string(),
            expected: NodeKind::Source,
        };
        assert_eq!(err.to_string(), "node `weight` is not a source node");
    }

    #[test]
    fn cycle_message_joins_the_path() {
        let err = GraphError::Cycle {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn compute_errors_downcast() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let err = GraphError::from(anyhow::Error::new(Boom));
        assert!(err.is::<Boom>());
        assert!(err.downcast_ref::<std::io::Error>().is_none());
    }
}
