//! Shared arena that owns every variable and operation record of a graph.
//!
//! Handles ([`Variable`], [`Operation`]) are an `Arc<GraphArena>` plus an index. Records
//! refer to each other only by index: an output stores the index of its owning operation,
//! an operation stores the indices of its input and output variables. Nothing inside the
//! arena holds a strong reference to anything else, so shared sub-expressions and even
//! cycles introduced by a bad substitution cannot keep memory alive.
//!
//! ## Builder context
//!
//! The arena doubles as the graph-builder context. It hands out uids from its own counter
//! (`Plus12`, `Parameter3`, ...), runs the monotonic clock that timestamps parameter
//! values, and keeps a structure version bumped whenever an existing operation is rewired.
//! Composites compare that version against the one they compiled for to detect staleness.
//! An arena is created by the caller and is never reset; its records live as long as any
//! handle into it.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use crate::error::{Result, StructuralError, UsageError};
use crate::tensor::{DType, Shape, Tensor};

use super::operation::{Dictionary, PrimitiveKind};
use super::traversal;
use super::variable::{Operation, OperationId, Variable, VariableId, VariableKind};

static ARENA_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct VariableRecord {
    pub(crate) kind: VariableKind,
    pub(crate) uid: String,
    pub(crate) name: String,
    pub(crate) shape: Option<Shape>,
    pub(crate) dtype: DType,
    pub(crate) needs_gradient: bool,
    /// Owning operation and output slot. Set exactly for outputs.
    pub(crate) owner: Option<(OperationId, usize)>,
    pub(crate) value: Option<Tensor>,
    pub(crate) timestamp: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct BlockDefinition {
    pub(crate) op_name: String,
    pub(crate) body: OperationId,
    /// Body placeholder and the block input slot that feeds it.
    pub(crate) bindings: Vec<(VariableId, usize)>,
}

#[derive(Debug, Clone)]
pub(crate) enum OpKind {
    Primitive(PrimitiveKind),
    Block(BlockDefinition),
}

pub(crate) struct OperationRecord {
    pub(crate) kind: OpKind,
    pub(crate) uid: String,
    pub(crate) name: String,
    pub(crate) inputs: Vec<VariableId>,
    pub(crate) outputs: Vec<VariableId>,
    pub(crate) attributes: Dictionary,
}

pub(crate) struct ArenaInner {
    pub(crate) variables: Vec<VariableRecord>,
    pub(crate) operations: Vec<OperationRecord>,
    next_uid: u64,
    clock: u64,
    structure_version: u64,
}

impl ArenaInner {
    fn fresh_uid(&mut self, prefix: &str) -> String {
        let uid = format!("{prefix}{}", self.next_uid);
        self.next_uid += 1;
        uid
    }

    /// Keeps the counter ahead of uids restored from a document.
    fn reserve_uid(&mut self, uid: &str) {
        let digits = uid.len() - uid.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        if let Ok(n) = uid[uid.len() - digits..].parse::<u64>() {
            self.next_uid = self.next_uid.max(n.saturating_add(1));
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Description of a variable to add to the arena.
pub(crate) struct NewVariable {
    pub(crate) kind: VariableKind,
    pub(crate) uid: Option<String>,
    pub(crate) name: String,
    pub(crate) shape: Option<Shape>,
    pub(crate) dtype: DType,
    pub(crate) needs_gradient: bool,
    pub(crate) value: Option<Tensor>,
}

/// Description of an operation to add to the arena.
pub(crate) struct NewOperation {
    pub(crate) kind: OpKind,
    pub(crate) uid: Option<String>,
    pub(crate) name: String,
    pub(crate) inputs: Vec<VariableId>,
    pub(crate) attributes: Dictionary,
    /// Explicit `(uid, name)` per output, used when restoring a document.
    pub(crate) outputs: Option<Vec<(String, String)>>,
}

/// Owner of all graph records plus the builder-context counters.
pub struct GraphArena {
    inner: Mutex<ArenaInner>,
    id: usize,
}

impl GraphArena {
    pub fn new() -> Arc<Self> {
        Arc::new(GraphArena {
            inner: Mutex::new(ArenaInner {
                variables: Vec::new(),
                operations: Vec::new(),
                next_uid: 0,
                clock: 0,
                structure_version: 0,
            }),
            id: ARENA_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Incremented whenever an existing operation is rewired.
    pub fn structure_version(&self) -> u64 {
        self.lock().structure_version
    }

    pub(crate) fn bump_structure(&self) -> u64 {
        let mut inner = self.lock();
        inner.structure_version += 1;
        inner.structure_version
    }

    pub fn variable_count(&self) -> usize {
        self.lock().variables.len()
    }

    pub fn operation_count(&self) -> usize {
        self.lock().operations.len()
    }

    /// Declares an externally supplied input that does not receive gradients.
    pub fn input(self: &Arc<Self>, name: impl Into<String>, shape: Shape, dtype: DType) -> Variable {
        self.create_variable(NewVariable {
            kind: VariableKind::Input,
            uid: None,
            name: name.into(),
            shape: Some(shape),
            dtype,
            needs_gradient: false,
            value: None,
        })
    }

    /// Declares an input for which backward can produce a gradient.
    pub fn input_with_gradient(
        self: &Arc<Self>,
        name: impl Into<String>,
        shape: Shape,
        dtype: DType,
    ) -> Variable {
        self.create_variable(NewVariable {
            kind: VariableKind::Input,
            uid: None,
            name: name.into(),
            shape: Some(shape),
            dtype,
            needs_gradient: dtype.is_float(),
            value: None,
        })
    }

    /// Declares a learnable parameter initialised to `value`.
    pub fn parameter(self: &Arc<Self>, name: impl Into<String>, value: Tensor) -> Variable {
        self.create_variable(NewVariable {
            kind: VariableKind::Parameter,
            uid: None,
            name: name.into(),
            shape: Some(value.shape().clone()),
            dtype: value.dtype(),
            needs_gradient: value.dtype().is_float(),
            value: Some(value),
        })
    }

    pub fn constant(self: &Arc<Self>, name: impl Into<String>, value: Tensor) -> Variable {
        self.create_variable(NewVariable {
            kind: VariableKind::Constant,
            uid: None,
            name: name.into(),
            shape: Some(value.shape().clone()),
            dtype: value.dtype(),
            needs_gradient: false,
            value: Some(value),
        })
    }

    /// Declares an unresolved input. `shape` may be left unknown until substitution.
    pub fn placeholder(
        self: &Arc<Self>,
        name: impl Into<String>,
        shape: Option<Shape>,
        dtype: DType,
    ) -> Variable {
        self.create_variable(NewVariable {
            kind: VariableKind::Placeholder,
            uid: None,
            name: name.into(),
            shape,
            dtype,
            needs_gradient: false,
            value: None,
        })
    }

    pub(crate) fn create_variable(self: &Arc<Self>, spec: NewVariable) -> Variable {
        let mut inner = self.lock();
        let uid = match spec.uid {
            Some(uid) => {
                inner.reserve_uid(&uid);
                uid
            }
            None => inner.fresh_uid(spec.kind.uid_prefix()),
        };
        let timestamp = if spec.value.is_some() { inner.tick() } else { 0 };
        let id = VariableId(inner.variables.len());
        inner.variables.push(VariableRecord {
            kind: spec.kind,
            uid,
            name: spec.name,
            shape: spec.shape,
            dtype: spec.dtype,
            needs_gradient: spec.needs_gradient,
            owner: None,
            value: spec.value,
            timestamp,
        });
        Variable::from_parts(Arc::clone(self), id)
    }

    /// Adds an operation and its output variables, inferring output shapes.
    pub(crate) fn create_operation(self: &Arc<Self>, spec: NewOperation) -> Result<Operation> {
        let output_count = match &spec.kind {
            OpKind::Primitive(PrimitiveKind::Combine) => spec.inputs.len(),
            OpKind::Primitive(_) => 1,
            OpKind::Block(definition) => self.lock().operations[definition.body.0].outputs.len(),
        };
        if let Some(outputs) = &spec.outputs {
            if outputs.len() != output_count {
                return Err(StructuralError::InvalidArity {
                    operation: spec.name,
                    expected: output_count,
                    found: outputs.len(),
                }
                .into());
            }
        }

        let id = {
            let mut inner = self.lock();
            let id = OperationId(inner.operations.len());
            let prefix = match &spec.kind {
                OpKind::Primitive(kind) => kind.name().to_string(),
                OpKind::Block(definition) => definition.op_name.clone(),
            };
            let uid = match spec.uid {
                Some(uid) => {
                    inner.reserve_uid(&uid);
                    uid
                }
                None => inner.fresh_uid(&prefix),
            };
            let mut outputs = Vec::with_capacity(output_count);
            for index in 0..output_count {
                let (output_uid, output_name) = match &spec.outputs {
                    Some(explicit) => {
                        inner.reserve_uid(&explicit[index].0);
                        explicit[index].clone()
                    }
                    None => (inner.fresh_uid(VariableKind::Output.uid_prefix()), String::new()),
                };
                let dtype = spec
                    .inputs
                    .first()
                    .map_or(DType::F32, |input| inner.variables[input.0].dtype);
                let var = VariableId(inner.variables.len());
                inner.variables.push(VariableRecord {
                    kind: VariableKind::Output,
                    uid: output_uid,
                    name: output_name,
                    shape: None,
                    dtype,
                    needs_gradient: false,
                    owner: Some((id, index)),
                    value: None,
                    timestamp: 0,
                });
                outputs.push(var);
            }
            inner.operations.push(OperationRecord {
                kind: spec.kind,
                uid,
                name: spec.name,
                inputs: spec.inputs,
                outputs,
                attributes: spec.attributes,
            });
            id
        };

        self.infer_operation(id)?;
        Ok(Operation::from_parts(Arc::clone(self), id))
    }

    /// Recomputes the output shapes of one operation from its current inputs.
    pub(crate) fn infer_operation(self: &Arc<Self>, op: OperationId) -> Result<()> {
        let (kind, name, inputs, outputs) = {
            let inner = self.lock();
            let record = &inner.operations[op.0];
            (
                record.kind.clone(),
                record.name.clone(),
                record.inputs.clone(),
                record.outputs.clone(),
            )
        };
        let label = if name.is_empty() {
            self.lock().operations[op.0].uid.clone()
        } else {
            name
        };

        let inferred = match kind {
            OpKind::Primitive(primitive) => {
                let specs: Vec<_> = {
                    let inner = self.lock();
                    inputs
                        .iter()
                        .map(|input| {
                            let record = &inner.variables[input.0];
                            (record.shape.clone(), record.dtype)
                        })
                        .collect()
                };
                primitive.infer(&label, &specs)?
            }
            OpKind::Block(definition) => {
                {
                    let mut inner = self.lock();
                    for (placeholder, slot) in &definition.bindings {
                        let argument = &inner.variables[inputs[*slot].0];
                        let (shape, dtype) = (argument.shape.clone(), argument.dtype);
                        let record = &mut inner.variables[placeholder.0];
                        if record.dtype != dtype {
                            return Err(StructuralError::ShapeMismatch {
                                operation: label,
                                detail: format!(
                                    "argument dtype {dtype:?} does not match placeholder {} ({:?})",
                                    record.uid, record.dtype
                                ),
                            }
                            .into());
                        }
                        if shape.is_some() {
                            record.shape = shape;
                        }
                    }
                }
                for body_op in traversal::operation_ids_postorder(self, definition.body) {
                    self.infer_operation(body_op)?;
                }
                let inner = self.lock();
                inner.operations[definition.body.0]
                    .outputs
                    .iter()
                    .map(|output| {
                        let record = &inner.variables[output.0];
                        (record.shape.clone(), record.dtype)
                    })
                    .collect()
            }
        };

        let mut inner = self.lock();
        for (output, (shape, dtype)) in outputs.iter().zip(inferred) {
            let record = &mut inner.variables[output.0];
            record.shape = shape;
            record.dtype = dtype;
        }
        Ok(())
    }

    /// Rewrites the input slots of `ops` through `replacements` in a single pass, so a
    /// replacement that is itself a key is not substituted again.
    pub(crate) fn rewire(
        &self,
        ops: &[OperationId],
        replacements: &HashMap<VariableId, VariableId>,
    ) -> usize {
        let mut inner = self.lock();
        let mut rewired = 0;
        for op in ops {
            for input in inner.operations[op.0].inputs.iter_mut() {
                if let Some(replacement) = replacements.get(input) {
                    *input = *replacement;
                    rewired += 1;
                }
            }
        }
        rewired
    }

    /// Claims `uid` when restoring a document, or mints a fresh one with `prefix`.
    pub(crate) fn claim_uid(&self, uid: Option<String>, prefix: &str) -> String {
        let mut inner = self.lock();
        match uid {
            Some(uid) => {
                inner.reserve_uid(&uid);
                uid
            }
            None => inner.fresh_uid(prefix),
        }
    }

    pub(crate) fn set_value(&self, var: VariableId, value: Tensor) -> Result<u64> {
        let mut inner = self.lock();
        let record = &inner.variables[var.0];
        if record.kind != VariableKind::Parameter {
            return Err(UsageError::NotAParameter {
                variable: record.uid.clone(),
            }
            .into());
        }
        if record.shape.as_ref() != Some(value.shape()) || record.dtype != value.dtype() {
            return Err(UsageError::ArgumentMismatch {
                variable: record.uid.clone(),
                expected_shape: record.shape.clone().unwrap_or_else(|| value.shape().clone()),
                expected_dtype: record.dtype,
                found_shape: value.shape().clone(),
                found_dtype: value.dtype(),
            }
            .into());
        }
        let timestamp = inner.tick();
        let record = &mut inner.variables[var.0];
        record.value = Some(value);
        record.timestamp = timestamp;
        Ok(timestamp)
    }

    pub(crate) fn set_attribute(&self, op: OperationId, key: &str, value: serde_json::Value) {
        self.lock().operations[op.0]
            .attributes
            .insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_come_from_the_arena_counter() {
        let arena = GraphArena::new();
        let x = arena.input("x", Shape::new([2]), DType::F32);
        let p = arena.placeholder("p", None, DType::F32);
        assert_eq!(x.uid(), "Input0");
        assert_eq!(p.uid(), "Placeholder1");

        let other = GraphArena::new();
        assert_eq!(other.input("x", Shape::new([2]), DType::F32).uid(), "Input0");
    }

    #[test]
    fn restored_uids_advance_the_counter() {
        let arena = GraphArena::new();
        arena.create_variable(NewVariable {
            kind: VariableKind::Input,
            uid: Some("Input41".to_string()),
            name: String::new(),
            shape: Some(Shape::new([1])),
            dtype: DType::F32,
            needs_gradient: false,
            value: None,
        });
        let next = arena.input("y", Shape::new([1]), DType::F32);
        assert_eq!(next.uid(), "Input42");
    }

    #[test]
    fn parameter_timestamps_increase_monotonically() {
        let arena = GraphArena::new();
        let w = arena.parameter("w", Tensor::scalar(1.0));
        let before = w.timestamp();
        w.set_value(Tensor::scalar(2.0)).unwrap();
        assert!(w.timestamp() > before);
    }

    #[test]
    fn set_value_rejects_non_parameters() {
        let arena = GraphArena::new();
        let x = arena.input("x", Shape::new([1]), DType::F32);
        assert!(x.set_value(Tensor::scalar(1.0)).is_err());
    }
}
