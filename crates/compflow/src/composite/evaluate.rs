//! Forward and backward evaluation through the compiled network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::backend::spec::{ComputationNetwork, Device, NodeId, PortableBackend};
use crate::error::{GraphError, Result, StructuralError, UsageError};
use crate::graph::traversal::variables_feeding;
use crate::graph::{Variable, VariableId, VariableKind};
use crate::profiling;
use crate::tensor::{Tensor, Value};

use super::compile::ExecutionGraph;
use super::CompositeGraph;

/// Everything a backward pass needs from the forward that produced it.
///
/// The handle stays usable until a parameter it read is mutated, a later forward
/// re-evaluates anything it depends on, or the network is rebuilt.
#[derive(Debug, Clone)]
pub struct BackpropState {
    composite: usize,
    build: u64,
    generation: u64,
    device: Device,
    roots: Vec<Variable>,
    parameter_timestamps: Vec<(Variable, u64)>,
}

impl BackpropState {
    /// Outputs retained for backpropagation.
    pub fn roots(&self) -> &[Variable] {
        &self.roots
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Parameters reachable from the roots with the timestamps observed by the forward.
    pub fn parameter_timestamps(&self) -> &[(Variable, u64)] {
        &self.parameter_timestamps
    }
}

fn check_matches(var: &Variable, tensor: &Tensor) -> Result<()> {
    let expected_shape = var.shape();
    let expected_dtype = var.dtype();
    if expected_shape.as_ref() == Some(tensor.shape()) && expected_dtype == tensor.dtype() {
        return Ok(());
    }
    Err(UsageError::ArgumentMismatch {
        variable: var.label(),
        expected_shape: expected_shape.unwrap_or_else(|| tensor.shape().clone()),
        expected_dtype,
        found_shape: tensor.shape().clone(),
        found_dtype: tensor.dtype(),
    }
    .into())
}

fn sorted_keys<V>(map: &HashMap<Variable, V>) -> Vec<Variable> {
    let mut keys: Vec<Variable> = map.keys().cloned().collect();
    keys.sort_by_key(Variable::id);
    keys
}

fn labels(vars: &[Variable]) -> String {
    vars.iter().map(Variable::label).collect::<Vec<_>>().join(", ")
}

impl<B: PortableBackend> CompositeGraph<B> {
    /// Evaluates `outputs` for the given `arguments`.
    ///
    /// Entries of `outputs` holding a [`Value`] are overwritten in place; `None` entries
    /// receive a fresh value that is erased at the start of the next evaluation. Outputs
    /// listed in `retain_for` can later be differentiated with [`CompositeGraph::backward`];
    /// inputs in `exclude_gradients_for` never receive gradients from that backward.
    ///
    /// Either every output is populated or the call fails and `outputs` is left untouched.
    pub fn forward(
        &mut self,
        arguments: &HashMap<Variable, Tensor>,
        outputs: &mut HashMap<Variable, Option<Value>>,
        device: Device,
        retain_for: &HashSet<Variable>,
        exclude_gradients_for: &HashSet<Variable>,
    ) -> Result<BackpropState> {
        let _prof_guard = profiling::compile_scope("composite.forward");
        if outputs.is_empty() {
            return Err(UsageError::EmptyRequest("forward outputs").into());
        }
        self.refresh_structure();

        let requested = sorted_keys(outputs);
        for var in &requested {
            if !self.produces(var) {
                return Err(UsageError::NotAnOutput {
                    variable: var.label(),
                }
                .into());
            }
        }
        for var in retain_for {
            if !outputs.contains_key(var) {
                return Err(UsageError::InvalidRetainRoot {
                    variable: var.label(),
                }
                .into());
            }
        }
        let inputs = self.inputs();
        for var in exclude_gradients_for {
            if !inputs.contains(var) {
                return Err(UsageError::NotAnInput {
                    variable: var.label(),
                }
                .into());
            }
        }

        let mut required: Vec<Variable> = Vec::new();
        for output in &requested {
            for dependency in self.argument_dependencies(output).iter() {
                if !required.contains(dependency) {
                    required.push(dependency.clone());
                }
            }
        }
        for var in sorted_keys(arguments) {
            if required.contains(&var) {
                continue;
            }
            if var.kind() == VariableKind::Input && inputs.contains(&var) {
                continue;
            }
            if self.options.lenient_arguments() {
                debug!(argument = %var.label(), "ignoring argument that is not a graph input");
                continue;
            }
            return Err(UsageError::NotAnInput {
                variable: var.label(),
            }
            .into());
        }
        let mut feeds = Vec::with_capacity(required.len());
        for var in &required {
            let tensor = arguments
                .get(var)
                .ok_or_else(|| UsageError::MissingArgument {
                    variable: var.label(),
                })?;
            check_matches(var, tensor)?;
            feeds.push((var.id(), tensor));
        }
        for var in &requested {
            if let Some(Some(value)) = outputs.get(var) {
                // An erased buffer is simply refilled.
                if let Ok(tensor) = value.tensor() {
                    check_matches(var, &tensor)?;
                }
            }
        }

        let excluded: HashSet<VariableId> =
            exclude_gradients_for.iter().map(Variable::id).collect();
        let mut execution = self.checkout_network(device, &requested, &excluded, true)?;

        // Stamp before arguments reach the engine so a failed evaluation still supersedes
        // earlier handles.
        self.generation += 1;
        let arena = Arc::clone(self.arena());
        for output in &requested {
            for var in variables_feeding(&arena, output.id()) {
                self.evaluated.insert(var, self.generation);
            }
        }

        let result = self.run_forward(&mut execution, &feeds, &requested);
        let build = execution.build;
        self.execution = Some(execution);
        let results = result?;

        for (var, tensor) in results {
            match outputs.get_mut(&var) {
                Some(Some(value)) => value.replace(tensor),
                Some(slot) => {
                    let value = Value::new(tensor);
                    self.storage.track(&value);
                    *slot = Some(value);
                }
                None => {}
            }
        }

        let mut roots: Vec<Variable> = retain_for.iter().cloned().collect();
        roots.sort_by_key(Variable::id);
        let mut parameter_timestamps: Vec<(Variable, u64)> = Vec::new();
        for root in &roots {
            for id in variables_feeding(&arena, root.id()) {
                let var = Variable::from_parts(Arc::clone(&arena), id);
                if var.kind() == VariableKind::Parameter
                    && !parameter_timestamps.iter().any(|(seen, _)| *seen == var)
                {
                    let timestamp = var.timestamp();
                    parameter_timestamps.push((var, timestamp));
                }
            }
        }

        debug!(
            composite = %self.uid,
            outputs = requested.len(),
            retained = roots.len(),
            generation = self.generation,
            "forward complete"
        );
        Ok(BackpropState {
            composite: self.id,
            build,
            generation: self.generation,
            device,
            roots,
            parameter_timestamps,
        })
    }

    fn run_forward(
        &mut self,
        execution: &mut ExecutionGraph<B::Network>,
        feeds: &[(VariableId, &Tensor)],
        requested: &[Variable],
    ) -> Result<Vec<(Variable, Tensor)>> {
        execution.sync_parameters(self.arena())?;
        for (var, tensor) in feeds {
            let node = network_node(execution, *var, self)?;
            execution
                .network
                .set_value(node, tensor)
                .map_err(GraphError::engine(format!("feeding argument {}", self.uid_of(*var))))?;
        }

        self.storage.clear_existing();

        let nodes = requested
            .iter()
            .map(|var| network_node(execution, var.id(), self))
            .collect::<Result<Vec<NodeId>>>()?;
        execution
            .network
            .forward(&nodes)
            .map_err(GraphError::engine(format!("evaluating {}", labels(requested))))?;

        requested
            .iter()
            .zip(nodes)
            .map(|(var, node)| {
                let tensor = execution
                    .network
                    .read(node)
                    .map_err(GraphError::engine(format!("reading {}", var.label())))?;
                Ok((var.clone(), tensor))
            })
            .collect()
    }

    /// Propagates `root_gradients` back through the forward captured by `state`.
    ///
    /// Entries of `input_gradients` follow the same convention as forward outputs. Inputs
    /// excluded from gradients in that forward are reported as `None`.
    pub fn backward(
        &mut self,
        state: &BackpropState,
        root_gradients: &HashMap<Variable, Tensor>,
        input_gradients: &mut HashMap<Variable, Option<Value>>,
    ) -> Result<()> {
        let _prof_guard = profiling::compile_scope("composite.backward");
        if state.composite != self.id {
            return Err(UsageError::ForeignHandle.into());
        }
        if root_gradients.is_empty() {
            return Err(UsageError::EmptyRequest("backward root gradients").into());
        }
        if input_gradients.is_empty() {
            return Err(UsageError::EmptyRequest("backward input gradients").into());
        }
        let seeds_for = sorted_keys(root_gradients);
        for var in &seeds_for {
            if !state.roots.contains(var) {
                return Err(UsageError::InvalidRetainRoot {
                    variable: var.label(),
                }
                .into());
            }
            if let Some(gradient) = root_gradients.get(var) {
                check_matches(var, gradient)?;
            }
        }

        for (var, slot) in input_gradients.iter() {
            if let Some(Ok(tensor)) = slot.as_ref().map(Value::tensor) {
                check_matches(var, &tensor)?;
            }
        }

        for (parameter, recorded) in &state.parameter_timestamps {
            let current = parameter.timestamp();
            if current != *recorded {
                return Err(UsageError::StaleHandle {
                    parameter: parameter.label(),
                    recorded: *recorded,
                    current,
                }
                .into());
            }
        }

        self.refresh_structure();
        let superseded = |variable: String| -> GraphError {
            UsageError::SupersededHandle { variable }.into()
        };
        let first_root = state.roots.first().map(Variable::label).unwrap_or_default();
        let Some(mut execution) = self.execution.take() else {
            return Err(superseded(first_root));
        };
        if execution.build != state.build {
            self.execution = Some(execution);
            return Err(superseded(first_root));
        }
        let arena = Arc::clone(self.arena());
        for root in &state.roots {
            for var in variables_feeding(&arena, root.id()) {
                if self.evaluated.get(&var).is_some_and(|g| *g > state.generation) {
                    self.execution = Some(execution);
                    return Err(superseded(self.uid_of(var)));
                }
            }
        }

        let result = self.run_backward(&mut execution, root_gradients, &seeds_for, input_gradients);
        self.execution = Some(execution);
        let gradients = result?;

        for (var, gradient) in gradients {
            let Some(slot) = input_gradients.get_mut(&var) else {
                continue;
            };
            let Some(tensor) = gradient else {
                *slot = None;
                continue;
            };
            match slot {
                Some(value) => value.replace(tensor),
                None => {
                    let value = Value::new(tensor);
                    self.storage.track(&value);
                    *slot = Some(value);
                }
            }
        }
        debug!(composite = %self.uid, seeds = seeds_for.len(), "backward complete");
        Ok(())
    }

    fn run_backward(
        &mut self,
        execution: &mut ExecutionGraph<B::Network>,
        root_gradients: &HashMap<Variable, Tensor>,
        seeds_for: &[Variable],
        input_gradients: &HashMap<Variable, Option<Value>>,
    ) -> Result<Vec<(Variable, Option<Tensor>)>> {
        let inputs = self.inputs();
        let requested = sorted_keys(input_gradients);
        let mut targets: Vec<(Variable, Option<NodeId>)> = Vec::new();
        let mut omitted: Vec<Variable> = Vec::new();
        for var in requested {
            if !inputs.contains(&var) {
                return Err(UsageError::NotAnInput {
                    variable: var.label(),
                }
                .into());
            }
            let differentiable = matches!(var.kind(), VariableKind::Parameter | VariableKind::Input)
                && var.needs_gradient();
            if !differentiable {
                return Err(UsageError::GradientNotAvailable {
                    variable: var.label(),
                }
                .into());
            }
            if execution.excluded.contains(&var.id()) {
                omitted.push(var);
                continue;
            }
            let node = execution.node(var.id());
            targets.push((var, node));
        }

        let mut seeds = Vec::with_capacity(seeds_for.len());
        for var in seeds_for {
            let node = network_node(execution, var.id(), self)?;
            if let Some(gradient) = root_gradients.get(var) {
                seeds.push((node, gradient.clone()));
            }
        }

        self.storage.clear_existing();

        let target_nodes: Vec<NodeId> = targets.iter().filter_map(|(_, node)| *node).collect();
        execution
            .network
            .backward(&seeds, &target_nodes)
            .map_err(GraphError::engine(format!("backpropagating from {}", labels(seeds_for))))?;

        let mut gradients = Vec::with_capacity(targets.len() + omitted.len());
        for (var, node) in targets {
            let gradient = match node {
                Some(node) => execution
                    .network
                    .read_gradient(node)
                    .map_err(GraphError::engine(format!("reading gradient of {}", var.label())))?,
                None => match var.shape() {
                    Some(shape) => Tensor::zeros(shape, var.dtype()),
                    None => continue,
                },
            };
            gradients.push((var, Some(gradient)));
        }
        if !omitted.is_empty() {
            debug!(omitted = %labels(&omitted), "gradients excluded in forward");
        }
        gradients.extend(omitted.into_iter().map(|var| (var, None)));
        Ok(gradients)
    }

    fn uid_of(&self, var: VariableId) -> String {
        Variable::from_parts(Arc::clone(self.arena()), var).label()
    }
}

fn network_node<B: PortableBackend, N: ComputationNetwork>(
    execution: &ExecutionGraph<N>,
    var: VariableId,
    graph: &CompositeGraph<B>,
) -> Result<NodeId> {
    execution
        .node(var)
        .ok_or_else(|| {
            StructuralError::NotCompiled {
                variable: graph.uid_of(var),
            }
            .into()
        })
}
