//! Invalidation traversal over the dependents-closure.

use slab::Slab;

use crate::state::NodeState;

/// Mark `start` and every transitive dependent invalid, clearing cached
/// values.
///
/// Dependents that are already invalid are not descended into, which bounds
/// the sweep to one useful visit per affected node even on diamond-shaped
/// graphs. This is pure bookkeeping over already-registered edges and never
/// fails.
pub(crate) fn invalidate_from(nodes: &mut Slab<NodeState>, start: usize) {
    let mut pending = vec![start];
    while let Some(index) = pending.pop() {
        let node = &mut nodes[index];
        let was_valid = node.valid;
        node.valid = false;
        node.value = None;
        if was_valid || index == start {
            pending.extend(node.children.iter().copied());
        }
    }
}
