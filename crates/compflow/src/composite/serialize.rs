//! Versioned documents describing a composite graph and the state of its stateful nodes.
//!
//! A document lists every leaf variable, then every operation in post-order (block bodies
//! right before the block that wraps them), so each reference points at something already
//! restored. Stateful-node state (`rng_seed`, `rng_offset`) travels differently per version:
//!
//! | version | state location                                       |
//! |---------|------------------------------------------------------|
//! | 1       | not recorded; restored graphs use attribute defaults |
//! | 2       | `state` side table keyed by operation uid            |
//! | 3       | inline in each operation's attributes                |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::backend::spec::{ComputationNetwork, Device, PortableBackend, StatefulNodeState};
use crate::error::{GraphError, Result, StructuralError, UsageError};
use crate::graph::arena::{BlockDefinition, NewOperation, NewVariable, OpKind};
use crate::graph::traversal::operation_ids_postorder;
use crate::graph::{
    attributes, Dictionary, GraphArena, Operation, OperationId, PrimitiveKind, VariableId,
    VariableKind,
};
use crate::profiling;
use crate::tensor::{DType, Shape, Tensor};

use super::{CompositeGraph, CompositeOptions};

pub const CURRENT_VERSION: u64 = 3;

/// Value of the `type` field of every document.
pub const DOCUMENT_TYPE: &str = "CompositeGraph";

const BLOCK_OP: &str = "Block";

#[derive(Debug, Serialize, Deserialize)]
struct VariableEntry {
    uid: String,
    #[serde(default)]
    name: String,
    kind: VariableKind,
    dtype: DType,
    shape: Option<Vec<usize>>,
    #[serde(default)]
    needs_gradient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Tensor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputEntry {
    uid: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BindingEntry {
    placeholder: String,
    slot: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockEntry {
    op_name: String,
    root: String,
    bindings: Vec<BindingEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OperationEntry {
    uid: String,
    #[serde(default)]
    name: String,
    op: String,
    inputs: Vec<String>,
    outputs: Vec<OutputEntry>,
    #[serde(default)]
    attributes: Dictionary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block: Option<BlockEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    #[serde(rename = "type")]
    document_type: String,
    version: u64,
    uid: String,
    #[serde(default)]
    name: String,
    root: String,
    variables: Vec<VariableEntry>,
    operations: Vec<OperationEntry>,
    #[serde(default, skip_serializing_if = "Dictionary::is_empty")]
    state: Dictionary,
}

/// Operations in document order: post-order from `root`, with every block body emitted
/// right before the first block that uses it.
fn document_order(arena: &GraphArena, root: OperationId) -> Vec<OperationId> {
    fn visit(
        arena: &GraphArena,
        root: OperationId,
        seen: &mut HashSet<OperationId>,
        out: &mut Vec<OperationId>,
    ) {
        for op in operation_ids_postorder(arena, root) {
            if seen.contains(&op) {
                continue;
            }
            let body = match &arena.lock().operations[op.0].kind {
                OpKind::Block(definition) => Some(definition.body),
                OpKind::Primitive(_) => None,
            };
            if let Some(body) = body {
                visit(arena, body, seen, out);
            }
            seen.insert(op);
            out.push(op);
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    visit(arena, root, &mut seen, &mut out);
    out
}

fn is_stateful(arena: &GraphArena, op: OperationId) -> bool {
    matches!(
        arena.lock().operations[op.0].kind,
        OpKind::Primitive(kind) if kind.is_stateful()
    )
}

fn state_from_attributes(attrs: &Dictionary) -> StatefulNodeState {
    let read = |key: &str| attrs.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);
    StatefulNodeState {
        rng_seed: read(attributes::RNG_SEED),
        rng_offset: read(attributes::RNG_OFFSET),
    }
}

fn write_state(arena: &GraphArena, op: OperationId, state: StatefulNodeState) {
    arena.set_attribute(op, attributes::RNG_SEED, json!(state.rng_seed));
    arena.set_attribute(op, attributes::RNG_OFFSET, json!(state.rng_offset));
}

fn strip_state(attrs: &mut Dictionary) {
    attrs.remove(attributes::RNG_SEED);
    attrs.remove(attributes::RNG_OFFSET);
}

impl<B: PortableBackend> CompositeGraph<B> {
    /// Emits the current-version document.
    pub fn serialize(&self) -> Result<Dictionary> {
        self.serialize_as(CURRENT_VERSION)
    }

    /// Emits a document in an older layout, for consumers that cannot read the current one.
    pub fn serialize_as(&self, version: u64) -> Result<Dictionary> {
        if !(1..=CURRENT_VERSION).contains(&version) {
            return Err(GraphError::UnsupportedVersion {
                found: version,
                supported: CURRENT_VERSION,
            });
        }
        let _prof_guard = profiling::compile_scope("composite.serialize");
        self.update_internal_state()?;

        let arena = self.arena();
        let order = document_order(arena, self.root.id());
        let inner = arena.lock();
        let uid_of = |var: VariableId| inner.variables[var.0].uid.clone();

        let mut seen_leaves = HashSet::new();
        let mut variables = Vec::new();
        let mut operations = Vec::with_capacity(order.len());
        let mut state = Dictionary::new();
        for op in &order {
            let record = &inner.operations[op.0];
            for input in &record.inputs {
                let leaf = &inner.variables[input.0];
                if leaf.kind == VariableKind::Output || !seen_leaves.insert(*input) {
                    continue;
                }
                variables.push(VariableEntry {
                    uid: leaf.uid.clone(),
                    name: leaf.name.clone(),
                    kind: leaf.kind,
                    dtype: leaf.dtype,
                    shape: leaf.shape.as_ref().map(|shape| shape.dims().to_vec()),
                    needs_gradient: leaf.needs_gradient,
                    value: leaf.value.clone(),
                });
            }

            let mut attributes = record.attributes.clone();
            let (op_name, block) = match &record.kind {
                OpKind::Primitive(kind) => {
                    if kind.is_stateful() && version < 3 {
                        if version == 2 {
                            let captured = state_from_attributes(&attributes);
                            state.insert(record.uid.clone(), serde_json::to_value(captured)?);
                        }
                        strip_state(&mut attributes);
                    }
                    (kind.name().to_string(), None)
                }
                OpKind::Block(definition) => (
                    BLOCK_OP.to_string(),
                    Some(BlockEntry {
                        op_name: definition.op_name.clone(),
                        root: inner.operations[definition.body.0].uid.clone(),
                        bindings: definition
                            .bindings
                            .iter()
                            .map(|(placeholder, slot)| BindingEntry {
                                placeholder: uid_of(*placeholder),
                                slot: *slot,
                            })
                            .collect(),
                    }),
                ),
            };
            operations.push(OperationEntry {
                uid: record.uid.clone(),
                name: record.name.clone(),
                op: op_name,
                inputs: record.inputs.iter().map(|input| uid_of(*input)).collect(),
                outputs: record
                    .outputs
                    .iter()
                    .map(|output| OutputEntry {
                        uid: uid_of(*output),
                        name: inner.variables[output.0].name.clone(),
                    })
                    .collect(),
                attributes,
                block,
            });
        }
        let root = inner.operations[self.root.id().0].uid.clone();
        drop(inner);

        let document = Document {
            document_type: DOCUMENT_TYPE.to_string(),
            version,
            uid: self.uid.clone(),
            name: self.name.clone(),
            root,
            variables,
            operations,
            state,
        };
        debug!(
            composite = %self.uid,
            version,
            operations = document.operations.len(),
            "serialized composite graph"
        );
        match serde_json::to_value(document)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(GraphError::format("document did not serialize to an object")),
        }
    }

    /// Rebuilds a composite from a document in a fresh arena.
    ///
    /// The restored graph keeps every uid and name of the serialized one. When it has no
    /// unresolved placeholders its network is compiled for `device` right away.
    pub fn deserialize(document: &Dictionary, backend: Arc<B>, device: Device) -> Result<Self> {
        Self::deserialize_with_options(document, backend, device, CompositeOptions::default())
    }

    /// Like [`CompositeGraph::deserialize`], with explicit options for the restored graph.
    pub fn deserialize_with_options(
        document: &Dictionary,
        backend: Arc<B>,
        device: Device,
        options: CompositeOptions,
    ) -> Result<Self> {
        let _prof_guard = profiling::compile_scope("composite.deserialize");
        let version = document
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| GraphError::format("missing or non-integer `version`"))?;
        if version == 0 || version > CURRENT_VERSION {
            return Err(GraphError::UnsupportedVersion {
                found: version,
                supported: CURRENT_VERSION,
            });
        }
        let document: Document =
            serde_json::from_value(serde_json::Value::Object(document.clone()))?;
        if document.document_type != DOCUMENT_TYPE {
            return Err(GraphError::format(format!(
                "expected a {DOCUMENT_TYPE} document, found `{}`",
                document.document_type
            )));
        }

        let arena = GraphArena::new();
        let mut restorer = Restorer {
            arena: &arena,
            variables: HashMap::new(),
            operations: HashMap::new(),
        };
        for entry in document.variables {
            restorer.restore_variable(entry)?;
        }
        for entry in document.operations {
            restorer.restore_operation(entry)?;
        }
        if version < 3 {
            restorer.restore_state(version, &document.state)?;
        }
        let root = restorer.operation(&document.root)?;

        let mut graph = Self::assemble(
            Operation::from_parts(Arc::clone(&arena), root),
            backend,
            options,
            Some(document.uid),
            document.name,
        )?;
        debug!(composite = %graph.uid, version, "deserialized composite graph");
        if graph.placeholders().is_empty() {
            graph.compile(device)?;
        }
        Ok(graph)
    }

    /// Current state of every stateful node, keyed by operation uid.
    pub fn internal_state(&self) -> Result<Dictionary> {
        let mut state = Dictionary::new();
        for (_, uid, node_state) in self.stateful_states()? {
            state.insert(uid, serde_json::to_value(node_state)?);
        }
        Ok(state)
    }

    /// Overwrites the state of the stateful nodes named in `state`.
    ///
    /// The compiled network is updated in place; the operation attributes are updated as
    /// well so a rebuilt network starts from the same state.
    pub fn set_internal_state(&mut self, state: &Dictionary) -> Result<()> {
        self.refresh_structure();
        let arena = Arc::clone(self.arena());
        let stateful: Vec<OperationId> = document_order(&arena, self.root.id())
            .into_iter()
            .filter(|op| is_stateful(&arena, *op))
            .collect();

        let mut updates = Vec::with_capacity(state.len());
        for (uid, value) in state {
            let op = stateful
                .iter()
                .copied()
                .find(|op| arena.lock().operations[op.0].uid == *uid)
                .ok_or_else(|| {
                    UsageError::IncompatibleState(format!(
                        "{uid} is not a stateful operation of this graph"
                    ))
                })?;
            let node_state: StatefulNodeState = serde_json::from_value(value.clone())?;
            updates.push((op, uid, node_state));
        }
        for (op, uid, node_state) in updates {
            write_state(&arena, op, node_state);
            if let Some(execution) = self.execution.as_mut() {
                let nodes: Vec<_> = execution
                    .stateful_nodes()
                    .iter()
                    .filter(|(owner, _)| *owner == op)
                    .map(|(_, node)| *node)
                    .collect();
                for node in nodes {
                    execution
                        .network
                        .set_internal_state(node, node_state)
                        .map_err(GraphError::engine(format!("restoring state of {uid}")))?;
                }
            }
        }
        Ok(())
    }

    /// Copies stateful-node state from a structurally equivalent graph.
    ///
    /// Stateful operations are matched by their position in document order.
    pub fn copy_state_from<O: PortableBackend>(&mut self, other: &CompositeGraph<O>) -> Result<()> {
        let source = other.stateful_states()?;
        let target = self.stateful_states()?;
        if source.len() != target.len() {
            return Err(UsageError::IncompatibleState(format!(
                "{} has {} stateful operations, {} has {}",
                other.uid,
                source.len(),
                self.uid,
                target.len()
            ))
            .into());
        }
        let mut state = Dictionary::new();
        for ((_, uid, _), (_, _, node_state)) in target.into_iter().zip(source) {
            state.insert(uid, serde_json::to_value(node_state)?);
        }
        self.set_internal_state(&state)
    }

    /// Copies engine-side state of stateful nodes back into operation attributes.
    fn update_internal_state(&self) -> Result<()> {
        let arena = self.arena();
        for (op, _, node_state) in self.stateful_states()? {
            write_state(arena, op, node_state);
        }
        Ok(())
    }

    /// Stateful operations in document order with their current state. A live network is
    /// authoritative; otherwise the attributes are.
    fn stateful_states(&self) -> Result<Vec<(OperationId, String, StatefulNodeState)>> {
        let arena = self.arena();
        let live = self.execution.as_ref().filter(|_| self.is_compiled());
        let mut states = Vec::new();
        for op in document_order(arena, self.root.id()) {
            if !is_stateful(arena, op) {
                continue;
            }
            let (uid, attrs) = {
                let inner = arena.lock();
                let record = &inner.operations[op.0];
                (record.uid.clone(), record.attributes.clone())
            };
            let node = live.and_then(|execution| {
                execution
                    .stateful_nodes()
                    .iter()
                    .find(|(owner, _)| *owner == op)
                    .map(|(_, node)| (execution, *node))
            });
            let engine_state = match node {
                Some((execution, node)) => execution
                    .network
                    .internal_state(node)
                    .map_err(GraphError::engine(format!("reading state of {uid}")))?,
                None => None,
            };
            let node_state = engine_state.unwrap_or_else(|| state_from_attributes(&attrs));
            states.push((op, uid, node_state));
        }
        Ok(states)
    }
}

/// Uid-to-handle tables of a document being restored.
struct Restorer<'a> {
    arena: &'a Arc<GraphArena>,
    variables: HashMap<String, VariableId>,
    operations: HashMap<String, OperationId>,
}

impl Restorer<'_> {
    fn variable(&self, uid: &str) -> Result<VariableId> {
        self.variables
            .get(uid)
            .copied()
            .ok_or_else(|| GraphError::format(format!("reference to unknown variable `{uid}`")))
    }

    fn operation(&self, uid: &str) -> Result<OperationId> {
        self.operations
            .get(uid)
            .copied()
            .ok_or_else(|| GraphError::format(format!("reference to unknown operation `{uid}`")))
    }

    fn claim_variable(&mut self, uid: &str, id: VariableId) -> Result<()> {
        if self.variables.insert(uid.to_string(), id).is_some() {
            return Err(GraphError::format(format!("duplicate variable uid `{uid}`")));
        }
        Ok(())
    }

    fn restore_variable(&mut self, entry: VariableEntry) -> Result<()> {
        if entry.kind == VariableKind::Output {
            return Err(GraphError::format(format!(
                "output `{}` listed as a leaf variable",
                entry.uid
            )));
        }
        let shape = match entry.shape {
            Some(dims) => Some(Shape::try_new(dims).ok_or_else(|| {
                GraphError::format(format!("variable `{}` has an empty shape", entry.uid))
            })?),
            None => None,
        };
        if entry.kind.holds_value() {
            let value = entry.value.as_ref().ok_or_else(|| {
                GraphError::format(format!("{:?} `{}` has no value", entry.kind, entry.uid))
            })?;
            if Some(value.shape()) != shape.as_ref() || value.dtype() != entry.dtype {
                return Err(GraphError::format(format!(
                    "value of `{}` does not match its declared shape or dtype",
                    entry.uid
                )));
            }
        }
        let uid = entry.uid.clone();
        let var = self.arena.create_variable(NewVariable {
            kind: entry.kind,
            uid: Some(entry.uid),
            name: entry.name,
            shape,
            dtype: entry.dtype,
            needs_gradient: entry.needs_gradient,
            value: entry.value.filter(|_| entry.kind.holds_value()),
        });
        self.claim_variable(&uid, var.id())
    }

    fn restore_operation(&mut self, entry: OperationEntry) -> Result<()> {
        if self.operations.contains_key(&entry.uid) {
            return Err(GraphError::format(format!(
                "duplicate operation uid `{}`",
                entry.uid
            )));
        }
        let inputs = entry
            .inputs
            .iter()
            .map(|uid| self.variable(uid))
            .collect::<Result<Vec<_>>>()?;

        let kind = match (entry.op.as_str(), entry.block) {
            (BLOCK_OP, Some(block)) => {
                let body = self.operation(&block.root)?;
                let mut bindings = Vec::with_capacity(block.bindings.len());
                for binding in &block.bindings {
                    if binding.slot >= inputs.len() {
                        return Err(GraphError::format(format!(
                            "block `{}` binds slot {} of {} inputs",
                            entry.uid,
                            binding.slot,
                            inputs.len()
                        )));
                    }
                    bindings.push((self.variable(&binding.placeholder)?, binding.slot));
                }
                OpKind::Block(BlockDefinition {
                    op_name: block.op_name,
                    body,
                    bindings,
                })
            }
            (BLOCK_OP, None) => {
                return Err(GraphError::format(format!(
                    "block `{}` has no block definition",
                    entry.uid
                )))
            }
            (name, _) => {
                let primitive = PrimitiveKind::from_name(name).ok_or_else(|| {
                    GraphError::format(format!("unknown operation kind `{name}`"))
                })?;
                if let Some(arity) = primitive.arity() {
                    if arity != inputs.len() {
                        return Err(StructuralError::InvalidArity {
                            operation: entry.uid,
                            expected: arity,
                            found: inputs.len(),
                        }
                        .into());
                    }
                }
                OpKind::Primitive(primitive)
            }
        };

        let uid = entry.uid.clone();
        let outputs: Vec<(String, String)> = entry
            .outputs
            .into_iter()
            .map(|output| (output.uid, output.name))
            .collect();
        let op = self.arena.create_operation(NewOperation {
            kind,
            uid: Some(entry.uid),
            name: entry.name,
            inputs,
            attributes: entry.attributes,
            outputs: Some(outputs),
        })?;
        for output in op.outputs() {
            self.claim_variable(&output.uid(), output.id())?;
        }
        self.operations.insert(uid, op.id());
        Ok(())
    }

    /// Applies the side table of a version 2 document. Version 1 documents carry no state,
    /// so their stateful operations keep whatever their attributes hold, zero otherwise.
    fn restore_state(&self, version: u64, state: &Dictionary) -> Result<()> {
        if version == 1 {
            for (uid, op) in &self.operations {
                if is_stateful(self.arena, *op) {
                    let attrs = self.arena.lock().operations[op.0].attributes.clone();
                    debug!(operation = %uid, "no recorded state, using attribute defaults");
                    write_state(self.arena, *op, state_from_attributes(&attrs));
                }
            }
            return Ok(());
        }
        for (uid, value) in state {
            let op = self.operation(uid)?;
            if !is_stateful(self.arena, op) {
                return Err(GraphError::format(format!(
                    "state recorded for stateless operation `{uid}`"
                )));
            }
            let node_state: StatefulNodeState = serde_json::from_value(value.clone())?;
            write_state(self.arena, op, node_state);
        }
        Ok(())
    }
}
