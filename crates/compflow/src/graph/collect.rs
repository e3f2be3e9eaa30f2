//! Transitive closure of the operations reachable from a root.

use std::collections::HashSet;
use std::sync::Arc;

use super::arena::GraphArena;
use super::traversal::{self, GraphVisitor, OperandOrder, VisitOrder};
use super::variable::{Operation, OperationId};

#[derive(Default)]
struct Collector {
    operations: HashSet<OperationId>,
}

impl GraphVisitor for Collector {
    fn visit_operation(&mut self, op: OperationId) {
        self.operations.insert(op);
    }
}

pub(crate) fn collect_ids(arena: &GraphArena, root: OperationId) -> HashSet<OperationId> {
    let mut collector = Collector::default();
    traversal::walk(
        arena,
        root,
        VisitOrder::PreOrder,
        OperandOrder::Declaration,
        &mut collector,
    );
    collector.operations
}

/// Every operation reachable from `root` by following outputs back to their owners,
/// including `root` itself.
pub fn collect(root: &Operation) -> HashSet<Operation> {
    collect_ids(root.arena(), root.id())
        .into_iter()
        .map(|id| Operation::from_parts(Arc::clone(root.arena()), id))
        .collect()
}
