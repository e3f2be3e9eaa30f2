//! Handles onto arena records.
//!
//! Both handle types compare and hash by identity (arena plus index), never by structure.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::{DType, Shape, Tensor};

use super::arena::{GraphArena, OpKind};
use super::operation::{Dictionary, PrimitiveKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    /// Externally supplied on every forward; no owner.
    Input,
    /// Produced by exactly one owning operation.
    Output,
    /// Externally supplied, persistent, timestamped on every mutation.
    Parameter,
    /// Externally supplied and immutable.
    Constant,
    /// Unresolved input that must be substituted before evaluation.
    Placeholder,
}

impl VariableKind {
    pub(crate) fn uid_prefix(self) -> &'static str {
        match self {
            VariableKind::Input => "Input",
            VariableKind::Output => "Output",
            VariableKind::Parameter => "Parameter",
            VariableKind::Constant => "Constant",
            VariableKind::Placeholder => "Placeholder",
        }
    }

    /// Leaves that hold their own value inside the arena.
    pub fn holds_value(self) -> bool {
        matches!(self, VariableKind::Parameter | VariableKind::Constant)
    }
}

/// A typed edge of the graph.
#[derive(Clone)]
pub struct Variable {
    arena: Arc<GraphArena>,
    id: VariableId,
}

impl Variable {
    pub(crate) fn from_parts(arena: Arc<GraphArena>, id: VariableId) -> Self {
        Variable { arena, id }
    }

    pub fn arena(&self) -> &Arc<GraphArena> {
        &self.arena
    }

    pub fn id(&self) -> VariableId {
        self.id
    }

    pub fn kind(&self) -> VariableKind {
        self.arena.lock().variables[self.id.0].kind
    }

    pub fn uid(&self) -> String {
        self.arena.lock().variables[self.id.0].uid.clone()
    }

    pub fn name(&self) -> String {
        self.arena.lock().variables[self.id.0].name.clone()
    }

    /// `None` until the shape can be inferred.
    pub fn shape(&self) -> Option<Shape> {
        self.arena.lock().variables[self.id.0].shape.clone()
    }

    pub fn dtype(&self) -> DType {
        self.arena.lock().variables[self.id.0].dtype
    }

    pub fn needs_gradient(&self) -> bool {
        self.arena.lock().variables[self.id.0].needs_gradient
    }

    pub fn is_output(&self) -> bool {
        self.kind() == VariableKind::Output
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind() == VariableKind::Placeholder
    }

    /// The operation producing this variable. Always `Some` for outputs, `None` otherwise.
    pub fn owner(&self) -> Option<Operation> {
        self.arena.lock().variables[self.id.0]
            .owner
            .map(|(op, _)| Operation::from_parts(Arc::clone(&self.arena), op))
    }

    /// Current value of a parameter or constant.
    pub fn value(&self) -> Option<Tensor> {
        self.arena.lock().variables[self.id.0].value.clone()
    }

    /// Replaces a parameter's value and advances its timestamp.
    pub fn set_value(&self, value: Tensor) -> Result<()> {
        self.arena.set_value(self.id, value).map(|_| ())
    }

    /// Timestamp of the last value assignment; 0 for variables without a value.
    pub fn timestamp(&self) -> u64 {
        self.arena.lock().variables[self.id.0].timestamp
    }

    pub(crate) fn same_arena(&self, arena: &Arc<GraphArena>) -> bool {
        Arc::ptr_eq(&self.arena, arena)
    }

    pub(crate) fn label(&self) -> String {
        let inner = self.arena.lock();
        let record = &inner.variables[self.id.0];
        if record.name.is_empty() {
            record.uid.clone()
        } else {
            format!("{} ({})", record.name, record.uid)
        }
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.id == other.id
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.arena.id().hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.arena.lock();
        let record = &inner.variables[self.id.0];
        write!(f, "{:?}({})", record.kind, record.uid)
    }
}

/// A computation node: a primitive delegated to the engine, or a block wrapping a
/// reusable sub-graph.
#[derive(Clone)]
pub struct Operation {
    arena: Arc<GraphArena>,
    id: OperationId,
}

impl Operation {
    pub(crate) fn from_parts(arena: Arc<GraphArena>, id: OperationId) -> Self {
        Operation { arena, id }
    }

    pub fn arena(&self) -> &Arc<GraphArena> {
        &self.arena
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn uid(&self) -> String {
        self.arena.lock().operations[self.id.0].uid.clone()
    }

    pub fn name(&self) -> String {
        self.arena.lock().operations[self.id.0].name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.arena.lock().operations[self.id.0].name = name.into();
    }

    /// Primitive kind, `None` for blocks.
    pub fn primitive(&self) -> Option<PrimitiveKind> {
        match &self.arena.lock().operations[self.id.0].kind {
            OpKind::Primitive(kind) => Some(*kind),
            OpKind::Block(_) => None,
        }
    }

    pub fn is_block(&self) -> bool {
        self.primitive().is_none()
    }

    /// Operation name shown for this node: the primitive name or the block's op name.
    pub fn op_name(&self) -> String {
        match &self.arena.lock().operations[self.id.0].kind {
            OpKind::Primitive(kind) => kind.name().to_string(),
            OpKind::Block(definition) => definition.op_name.clone(),
        }
    }

    /// Root of the wrapped sub-graph for blocks.
    pub fn block_root(&self) -> Option<Operation> {
        match &self.arena.lock().operations[self.id.0].kind {
            OpKind::Block(definition) => {
                Some(Operation::from_parts(Arc::clone(&self.arena), definition.body))
            }
            OpKind::Primitive(_) => None,
        }
    }

    /// Body placeholders paired with the block arguments that feed them.
    pub fn block_bindings(&self) -> Vec<(Variable, Variable)> {
        let inner = self.arena.lock();
        let record = &inner.operations[self.id.0];
        match &record.kind {
            OpKind::Block(definition) => definition
                .bindings
                .iter()
                .map(|(placeholder, slot)| {
                    (
                        Variable::from_parts(Arc::clone(&self.arena), *placeholder),
                        Variable::from_parts(Arc::clone(&self.arena), record.inputs[*slot]),
                    )
                })
                .collect(),
            OpKind::Primitive(_) => Vec::new(),
        }
    }

    /// Inputs in declaration order.
    pub fn inputs(&self) -> Vec<Variable> {
        self.arena.lock().operations[self.id.0]
            .inputs
            .iter()
            .map(|id| Variable::from_parts(Arc::clone(&self.arena), *id))
            .collect()
    }

    pub fn outputs(&self) -> Vec<Variable> {
        self.arena.lock().operations[self.id.0]
            .outputs
            .iter()
            .map(|id| Variable::from_parts(Arc::clone(&self.arena), *id))
            .collect()
    }

    /// First output. Every operation has at least one.
    pub fn output(&self) -> Variable {
        let id = self.arena.lock().operations[self.id.0].outputs[0];
        Variable::from_parts(Arc::clone(&self.arena), id)
    }

    pub fn attributes(&self) -> Dictionary {
        self.arena.lock().operations[self.id.0].attributes.clone()
    }

    pub fn attribute(&self, key: &str) -> Option<serde_json::Value> {
        self.arena.lock().operations[self.id.0]
            .attributes
            .get(key)
            .cloned()
    }

    pub(crate) fn label(&self) -> String {
        let inner = self.arena.lock();
        let record = &inner.operations[self.id.0];
        if record.name.is_empty() {
            record.uid.clone()
        } else {
            format!("{} ({})", record.name, record.uid)
        }
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.id == other.id
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.arena.id().hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({})", self.arena.lock().operations[self.id.0].uid)
    }
}
