//! Lazily builds and caches the executable network of a composite graph.
//!
//! One engine node is built per symbolic variable, depth first, so every node's inputs
//! exist before the node itself. Leaves (inputs, parameters, constants) always live in
//! the global scope and therefore map to a single node no matter how many blocks read
//! them. Each block instantiation opens a child scope in which the body's placeholders
//! resolve to the nodes of the block's arguments.
//!
//! The network is reused until the arena structure changes, the device changes, or a
//! forward asks for a different set of gradient exclusions; any of those discards it and
//! the next evaluation rebuilds from scratch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::spec::{
    ComputationNetwork, Device, LeafRole, LeafSpec, NodeId, NodeSpec, PortableBackend,
};
use crate::error::{GraphError, Result, StructuralError};
use crate::graph::arena::OpKind;
use crate::graph::{GraphArena, OperationId, Variable, VariableId, VariableKind};
use crate::profiling;

use super::CompositeGraph;

pub(crate) type ScopeId = usize;

pub(crate) const GLOBAL_SCOPE: ScopeId = 0;

pub(crate) struct ExecutionGraph<N> {
    pub(crate) network: N,
    pub(crate) device: Device,
    pub(crate) excluded: HashSet<VariableId>,
    /// Build counter of the owning composite at construction.
    pub(crate) build: u64,
    nodes: HashMap<(ScopeId, VariableId), NodeId>,
    is_root: HashMap<VariableId, bool>,
    roots: Vec<VariableId>,
    storage_allocated: bool,
    /// Stateful operations and the node holding their state; one entry per instantiation.
    stateful: Vec<(OperationId, NodeId)>,
    /// Parameter timestamps last pushed into the network.
    recorded_timestamps: HashMap<VariableId, u64>,
    next_scope: ScopeId,
}

impl<N: ComputationNetwork> ExecutionGraph<N> {
    fn new(network: N, device: Device, excluded: HashSet<VariableId>, build: u64) -> Self {
        ExecutionGraph {
            network,
            device,
            excluded,
            build,
            nodes: HashMap::new(),
            is_root: HashMap::new(),
            roots: Vec::new(),
            storage_allocated: false,
            stateful: Vec::new(),
            recorded_timestamps: HashMap::new(),
            next_scope: GLOBAL_SCOPE + 1,
        }
    }

    /// Node of a top-level variable.
    pub(crate) fn node(&self, var: VariableId) -> Option<NodeId> {
        self.nodes.get(&(GLOBAL_SCOPE, var)).copied()
    }

    pub(crate) fn is_root(&self, var: VariableId) -> bool {
        self.is_root.get(&var).copied().unwrap_or(false)
    }

    pub(crate) fn stateful_nodes(&self) -> &[(OperationId, NodeId)] {
        &self.stateful
    }

    fn root_nodes(&self) -> Vec<NodeId> {
        self.roots.iter().filter_map(|var| self.node(*var)).collect()
    }

    /// Pushes parameter values whose timestamp moved since they were last recorded.
    pub(crate) fn sync_parameters(&mut self, arena: &GraphArena) -> Result<usize> {
        let mut stale = Vec::new();
        {
            let inner = arena.lock();
            for (var, recorded) in &self.recorded_timestamps {
                let record = &inner.variables[var.0];
                if record.timestamp != *recorded {
                    if let Some(value) = &record.value {
                        stale.push((*var, record.timestamp, value.clone(), record.uid.clone()));
                    }
                }
            }
        }
        let synced = stale.len();
        for (var, timestamp, value, uid) in stale {
            let node = self
                .node(var)
                .ok_or_else(|| StructuralError::NotCompiled {
                    variable: uid.clone(),
                })?;
            self.network
                .set_value(node, &value)
                .map_err(GraphError::engine(format!("updating parameter {uid}")))?;
            self.recorded_timestamps.insert(var, timestamp);
        }
        if synced > 0 {
            debug!(synced, "pushed updated parameter values into the network");
        }
        Ok(synced)
    }

    fn add_roots(&mut self, arena: &Arc<GraphArena>, outputs: &[Variable]) -> Result<()> {
        let mut builder = NetworkBuilder {
            graph: self,
            arena,
            scopes: HashMap::new(),
            in_progress: HashSet::new(),
        };
        for output in outputs {
            if builder.graph.is_root(output.id()) {
                continue;
            }
            builder.build_variable(GLOBAL_SCOPE, output.id())?;
            builder.graph.is_root.insert(output.id(), true);
            builder.graph.roots.push(output.id());
            builder.graph.storage_allocated = false;
        }
        Ok(())
    }

    fn allocate(&mut self) -> Result<()> {
        if self.storage_allocated {
            return Ok(());
        }
        let roots = self.root_nodes();
        self.network
            .allocate(&roots)
            .map_err(GraphError::engine("allocating network storage"))?;
        self.storage_allocated = true;
        Ok(())
    }
}

struct NetworkBuilder<'a, N> {
    graph: &'a mut ExecutionGraph<N>,
    arena: &'a Arc<GraphArena>,
    /// Placeholder bindings of each block scope.
    scopes: HashMap<ScopeId, HashMap<VariableId, NodeId>>,
    in_progress: HashSet<(ScopeId, OperationId)>,
}

impl<N: ComputationNetwork> NetworkBuilder<'_, N> {
    fn build_variable(&mut self, scope: ScopeId, var: VariableId) -> Result<NodeId> {
        let (kind, owner) = {
            let inner = self.arena.lock();
            let record = &inner.variables[var.0];
            (record.kind, record.owner)
        };
        let key_scope = match kind {
            VariableKind::Input | VariableKind::Parameter | VariableKind::Constant => GLOBAL_SCOPE,
            VariableKind::Output | VariableKind::Placeholder => scope,
        };
        if let Some(node) = self.graph.nodes.get(&(key_scope, var)) {
            return Ok(*node);
        }

        match kind {
            VariableKind::Input | VariableKind::Parameter | VariableKind::Constant => {
                self.build_leaf(var, kind)
            }
            VariableKind::Placeholder => {
                let bound = self
                    .scopes
                    .get(&scope)
                    .and_then(|bindings| bindings.get(&var))
                    .copied();
                match bound {
                    Some(node) => {
                        self.graph.nodes.insert((scope, var), node);
                        Ok(node)
                    }
                    None => Err(StructuralError::UnresolvedPlaceholder {
                        placeholder: self.arena.lock().variables[var.0].uid.clone(),
                    }
                    .into()),
                }
            }
            VariableKind::Output => {
                let arena = self.arena;
                let cycle = || StructuralError::CycleDetected {
                    variable: arena.lock().variables[var.0].uid.clone(),
                };
                let Some((op, _)) = owner else {
                    return Err(cycle().into());
                };
                if self.in_progress.contains(&(scope, op)) {
                    return Err(cycle().into());
                }
                self.build_operation(scope, op)?;
                self.graph
                    .nodes
                    .get(&(scope, var))
                    .copied()
                    .ok_or_else(|| cycle().into())
            }
        }
    }

    fn build_leaf(&mut self, var: VariableId, kind: VariableKind) -> Result<NodeId> {
        let (uid, shape, dtype, needs_gradient, value, timestamp) = {
            let inner = self.arena.lock();
            let record = &inner.variables[var.0];
            (
                record.uid.clone(),
                record.shape.clone(),
                record.dtype,
                record.needs_gradient,
                record.value.clone(),
                record.timestamp,
            )
        };
        let shape = shape.ok_or_else(|| StructuralError::UnknownShape {
            variable: uid.clone(),
        })?;
        let role = match kind {
            VariableKind::Parameter => LeafRole::Parameter,
            VariableKind::Constant => LeafRole::Constant,
            _ => LeafRole::Input,
        };
        let needs_gradient =
            role != LeafRole::Constant && needs_gradient && !self.graph.excluded.contains(&var);
        let node = self
            .graph
            .network
            .add_leaf(
                LeafSpec {
                    name: &uid,
                    role,
                    shape,
                    dtype,
                    needs_gradient,
                },
                value.as_ref(),
            )
            .map_err(GraphError::engine(format!("adding leaf {uid}")))?;
        if role == LeafRole::Parameter {
            self.graph.recorded_timestamps.insert(var, timestamp);
        }
        self.graph.nodes.insert((GLOBAL_SCOPE, var), node);
        trace!(variable = %uid, node = node.0, "built leaf node");
        Ok(node)
    }

    fn build_operation(&mut self, scope: ScopeId, op: OperationId) -> Result<()> {
        self.in_progress.insert((scope, op));
        let (kind, label, inputs, outputs, attributes) = {
            let inner = self.arena.lock();
            let record = &inner.operations[op.0];
            let label = if record.name.is_empty() {
                record.uid.clone()
            } else {
                record.name.clone()
            };
            (
                record.kind.clone(),
                label,
                record.inputs.clone(),
                record.outputs.clone(),
                record.attributes.clone(),
            )
        };

        match kind {
            OpKind::Primitive(primitive) => {
                let input_nodes = inputs
                    .iter()
                    .map(|input| self.build_variable(scope, *input))
                    .collect::<Result<Vec<_>>>()?;
                for (index, output) in outputs.iter().enumerate() {
                    let (shape, dtype) = {
                        let inner = self.arena.lock();
                        let record = &inner.variables[output.0];
                        (record.shape.clone(), record.dtype)
                    };
                    let shape = shape.ok_or_else(|| StructuralError::UnknownShape {
                        variable: self.arena.lock().variables[output.0].uid.clone(),
                    })?;
                    let node = self
                        .graph
                        .network
                        .build_node(
                            NodeSpec {
                                name: &label,
                                kind: primitive,
                                output_index: index,
                                attributes: &attributes,
                                shape,
                                dtype,
                            },
                            &input_nodes,
                        )
                        .map_err(GraphError::engine(format!("building {label}")))?;
                    self.graph.nodes.insert((scope, *output), node);
                    if index == 0 && primitive.is_stateful() {
                        self.graph.stateful.push((op, node));
                    }
                    trace!(operation = %label, node = node.0, scope, "built node");
                }
            }
            OpKind::Block(definition) => {
                let child = self.graph.next_scope;
                self.graph.next_scope += 1;
                let mut bindings = HashMap::with_capacity(definition.bindings.len());
                for (placeholder, slot) in &definition.bindings {
                    bindings.insert(*placeholder, self.build_variable(scope, inputs[*slot])?);
                }
                self.scopes.insert(child, bindings);
                let body_outputs = self.arena.lock().operations[definition.body.0]
                    .outputs
                    .clone();
                for (output, body_output) in outputs.iter().zip(body_outputs) {
                    let node = self.build_variable(child, body_output)?;
                    self.graph.nodes.insert((scope, *output), node);
                }
                trace!(block = %label, scope = child, "instantiated block");
            }
        }

        self.in_progress.remove(&(scope, op));
        Ok(())
    }
}

impl<B: PortableBackend> CompositeGraph<B> {
    /// Takes the compiled network out of the composite, building or extending it so that
    /// every variable in `outputs` is a root. The caller puts it back when done.
    pub(super) fn checkout_network(
        &mut self,
        device: Device,
        outputs: &[Variable],
        excluded: &HashSet<VariableId>,
        allocate_storage: bool,
    ) -> Result<ExecutionGraph<B::Network>> {
        let _prof_guard = profiling::compile_scope("composite.checkout_network");
        self.refresh_structure();

        let reusable = match self.execution.take() {
            Some(execution) if execution.device != device => {
                self.invalidate_detached("device changed");
                None
            }
            Some(execution) if &execution.excluded != excluded => {
                self.invalidate_detached("gradient exclusions changed");
                None
            }
            Some(execution) => {
                profiling::cache_event("network_cache_hit");
                Some(execution)
            }
            None => None,
        };

        let mut execution = match reusable {
            Some(execution) => execution,
            None => {
                let network = self.backend.create_network(device).map_err(GraphError::engine(
                    format!(
                        "creating a {} network on {device}",
                        self.backend.backend_name()
                    ),
                ))?;
                self.builds += 1;
                profiling::cache_event("network_build");
                debug!(
                    composite = %self.uid,
                    backend = self.backend.backend_name(),
                    %device,
                    build = self.builds,
                    "building network"
                );
                ExecutionGraph::new(network, device, excluded.clone(), self.builds)
            }
        };

        let arena = Arc::clone(self.arena());
        execution.add_roots(&arena, outputs)?;
        if allocate_storage {
            execution.allocate()?;
        }
        Ok(execution)
    }

    fn invalidate_detached(&mut self, reason: &'static str) {
        self.evaluated.clear();
        profiling::cache_event("network_invalidated");
        debug!(composite = %self.uid, reason, "discarded compiled network");
    }
}
