//! The single graph walker shared by collection, input discovery, dependency pruning, shape
//! inference, compilation order and serialization.
//!
//! Starting from a root operation, the walker follows each input that is an output back to
//! its owning operation. Every operation is entered at most once (tracked by identity) and
//! every variable is reported at most once, so shared sub-expressions are visited a single
//! time and a cycle introduced by a bad substitution still terminates.
//!
//! In pre-order an operation's outputs are reported before the walker descends into its
//! inputs; in post-order they are reported after all inputs. Block operations are opaque
//! here: the walk continues through their inputs, not into their bodies.

use std::collections::HashSet;
use std::sync::Arc;

use super::arena::{GraphArena, OpKind};
use super::operation::PrimitiveKind;
use super::variable::{Operation, OperationId, Variable, VariableId, VariableKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    PreOrder,
    PostOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandOrder {
    /// Inputs in the order they were declared.
    Declaration,
    /// Inputs in natural operand order; see [`PrimitiveKind::natural_order`](super::PrimitiveKind::natural_order).
    Natural,
}

pub(crate) trait GraphVisitor {
    fn visit_variable(&mut self, _var: VariableId) {}
    fn visit_operation(&mut self, _op: OperationId) {}
}

struct Walker<'a, V: GraphVisitor> {
    arena: &'a GraphArena,
    order: VisitOrder,
    operand_order: OperandOrder,
    visited_ops: HashSet<OperationId>,
    visited_vars: HashSet<VariableId>,
    visitor: &'a mut V,
}

impl<V: GraphVisitor> Walker<'_, V> {
    fn walk_operation(&mut self, op: OperationId) {
        if !self.visited_ops.insert(op) {
            return;
        }
        let (mut inputs, outputs) = {
            let inner = self.arena.lock();
            let record = &inner.operations[op.0];
            let mut inputs = record.inputs.clone();
            if let (OperandOrder::Natural, OpKind::Primitive(kind)) =
                (self.operand_order, &record.kind)
            {
                kind.natural_order(&mut inputs);
            }
            (inputs, record.outputs.clone())
        };

        if self.order == VisitOrder::PreOrder {
            self.visitor.visit_operation(op);
            for output in &outputs {
                self.visit_variable(*output);
            }
        }

        for input in inputs.drain(..) {
            let owner = self.arena.lock().variables[input.0].owner;
            match owner {
                Some((producer, _)) => self.walk_operation(producer),
                None => self.visit_variable(input),
            }
        }

        if self.order == VisitOrder::PostOrder {
            for output in &outputs {
                self.visit_variable(*output);
            }
            self.visitor.visit_operation(op);
        }
    }

    fn visit_variable(&mut self, var: VariableId) {
        if self.visited_vars.insert(var) {
            self.visitor.visit_variable(var);
        }
    }
}

pub(crate) fn walk<V: GraphVisitor>(
    arena: &GraphArena,
    root: OperationId,
    order: VisitOrder,
    operand_order: OperandOrder,
    visitor: &mut V,
) {
    let mut walker = Walker {
        arena,
        order,
        operand_order,
        visited_ops: HashSet::new(),
        visited_vars: HashSet::new(),
        visitor,
    };
    walker.walk_operation(root);
}

struct FnVisitor<FV, FO> {
    on_variable: FV,
    on_operation: FO,
}

impl<FV: FnMut(VariableId), FO: FnMut(OperationId)> GraphVisitor for FnVisitor<FV, FO> {
    fn visit_variable(&mut self, var: VariableId) {
        (self.on_variable)(var)
    }

    fn visit_operation(&mut self, op: OperationId) {
        (self.on_operation)(op)
    }
}

/// Visits every variable reachable from `root` exactly once.
pub fn traverse_variables(
    root: &Operation,
    order: VisitOrder,
    operand_order: OperandOrder,
    mut f: impl FnMut(&Variable),
) {
    let arena = root.arena();
    let mut visitor = FnVisitor {
        on_variable: |id: VariableId| f(&Variable::from_parts(Arc::clone(arena), id)),
        on_operation: |_: OperationId| {},
    };
    walk(arena, root.id(), order, operand_order, &mut visitor);
}

pub fn preorder_traverse_variables(root: &Operation, f: impl FnMut(&Variable)) {
    traverse_variables(root, VisitOrder::PreOrder, OperandOrder::Declaration, f)
}

pub fn postorder_traverse_variables(root: &Operation, f: impl FnMut(&Variable)) {
    traverse_variables(root, VisitOrder::PostOrder, OperandOrder::Declaration, f)
}

/// Visits every operation reachable from `root` exactly once. Post-order yields producers
/// before consumers.
pub fn traverse_operations(root: &Operation, order: VisitOrder, mut f: impl FnMut(&Operation)) {
    let arena = root.arena();
    let mut visitor = FnVisitor {
        on_variable: |_: VariableId| {},
        on_operation: |id: OperationId| f(&Operation::from_parts(Arc::clone(arena), id)),
    };
    walk(arena, root.id(), order, OperandOrder::Declaration, &mut visitor);
}

pub(crate) fn operation_ids_postorder(arena: &GraphArena, root: OperationId) -> Vec<OperationId> {
    let mut ops = Vec::new();
    let mut visitor = FnVisitor {
        on_variable: |_: VariableId| {},
        on_operation: |id: OperationId| ops.push(id),
    };
    walk(
        arena,
        root,
        VisitOrder::PostOrder,
        OperandOrder::Declaration,
        &mut visitor,
    );
    ops
}

/// Non-output variables reachable from `root`, deduplicated in first-seen pre-order.
pub(crate) fn leaf_ids(arena: &GraphArena, root: OperationId) -> Vec<VariableId> {
    let mut seen = Vec::new();
    let mut visitor = FnVisitor {
        on_variable: |id: VariableId| seen.push(id),
        on_operation: |_: OperationId| {},
    };
    walk(
        arena,
        root,
        VisitOrder::PreOrder,
        OperandOrder::Declaration,
        &mut visitor,
    );
    let inner = arena.lock();
    seen.retain(|id| inner.variables[id.0].kind != VariableKind::Output);
    seen
}

/// `var` plus every variable it is computed from. A `Combine` output only depends on the
/// input it passes through. Each variable is reported once, so a pass-through chain that
/// loops back on itself still terminates.
pub(crate) fn variables_feeding(arena: &GraphArena, var: VariableId) -> Vec<VariableId> {
    let mut seen = HashSet::new();
    let mut reached = Vec::new();
    let mut current = var;
    loop {
        if !seen.insert(current) {
            break;
        }
        reached.push(current);
        let (owner, passthrough) = {
            let inner = arena.lock();
            match inner.variables[current.0].owner {
                Some((op, index)) => {
                    let record = &inner.operations[op.0];
                    match record.kind {
                        OpKind::Primitive(PrimitiveKind::Combine) => {
                            (None, Some(record.inputs[index]))
                        }
                        _ => (Some(op), None),
                    }
                }
                None => (None, None),
            }
        };
        if let Some(input) = passthrough {
            current = input;
            continue;
        }
        if let Some(op) = owner {
            let mut visitor = FnVisitor {
                on_variable: |id: VariableId| {
                    if seen.insert(id) {
                        reached.push(id);
                    }
                },
                on_operation: |_: OperationId| {},
            };
            walk(
                arena,
                op,
                VisitOrder::PreOrder,
                OperandOrder::Declaration,
                &mut visitor,
            );
        }
        break;
    }
    reached
}
