use std::collections::HashSet;

use compflow::backend::spec::{
    BackendError, BackendResult, ComputationNetwork, Device, LeafRole, LeafSpec, NodeId, NodeSpec,
    PortableBackend, StatefulNodeState,
};
use compflow::graph::{attributes, Dictionary, PrimitiveKind};
use compflow::tensor::{DType, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

/// Host execution engine. Values are computed in `f64` and narrowed on read.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl PortableBackend for CpuBackend {
    type Network = CpuNetwork;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn create_network(&self, device: Device) -> BackendResult<CpuNetwork> {
        match device {
            Device::Cpu => Ok(CpuNetwork::default()),
            other => Err(BackendError::unimplemented(
                "create_network",
                format!("device {other} is not available on the cpu backend"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
struct DropoutState {
    rate: f64,
    seed: u64,
    offset: u64,
    mask: Vec<f64>,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf(LeafRole),
    Compute {
        kind: PrimitiveKind,
        output_index: usize,
        inputs: Vec<NodeId>,
    },
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: NodeKind,
    shape: Shape,
    dtype: DType,
    needs_gradient: bool,
    allocated: bool,
    value: Option<Vec<f64>>,
    gradient: Option<Vec<f64>>,
    dropout: Option<DropoutState>,
}

impl Node {
    /// Nodes whose values this node reads. A `Combine` output only reads the input it
    /// passes through.
    fn dependencies(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Leaf(_) => &[],
            NodeKind::Compute {
                kind: PrimitiveKind::Combine,
                output_index,
                inputs,
            } => inputs.get(*output_index..*output_index + 1).unwrap_or(&[]),
            NodeKind::Compute { inputs, .. } => inputs,
        }
    }
}

/// Network of host nodes, kept in insertion order. Because inputs are always added first,
/// ascending `NodeId` order is a topological order.
#[derive(Debug, Default)]
pub struct CpuNetwork {
    nodes: Vec<Node>,
    forward_runs: u64,
}

impl CpuNetwork {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of forward passes run on this network.
    pub fn forward_runs(&self) -> u64 {
        self.forward_runs
    }

    fn node(&self, id: NodeId) -> BackendResult<&Node> {
        self.nodes.get(id.0).ok_or(BackendError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> BackendResult<&mut Node> {
        self.nodes.get_mut(id.0).ok_or(BackendError::UnknownNode(id))
    }

    /// `roots` and every node they depend on.
    fn reachable(&self, roots: &[NodeId]) -> BackendResult<HashSet<NodeId>> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            stack.extend(self.node(id)?.dependencies().iter().copied());
        }
        Ok(seen)
    }

    fn input_values(&self, inputs: &[NodeId]) -> BackendResult<Vec<&[f64]>> {
        inputs
            .iter()
            .map(|id| {
                let node = self.node(*id)?;
                node.value.as_deref().ok_or_else(|| {
                    BackendError::execution(format!("{} has no value", node.name))
                })
            })
            .collect()
    }

    fn evaluate(&mut self, id: NodeId) -> BackendResult<()> {
        let (kind, inputs) = match &self.node(id)?.kind {
            NodeKind::Leaf(_) => {
                let node = self.node(id)?;
                if node.value.is_none() {
                    return Err(BackendError::execution(format!(
                        "no value was supplied for {}",
                        node.name
                    )));
                }
                return Ok(());
            }
            NodeKind::Compute { kind, inputs, .. } => (*kind, inputs.clone()),
        };

        let node = self.node(id)?;
        let shape = node.shape.clone();
        if kind == PrimitiveKind::Combine {
            let source = node.dependencies().to_vec();
            let value = expect_single(&self.input_values(&source)?)?.to_vec();
            self.node_mut(id)?.value = Some(value);
            return Ok(());
        }
        let operands = self.input_values(&inputs)?;
        let input_shapes = inputs
            .iter()
            .map(|input| self.node(*input).map(|node| node.shape.clone()))
            .collect::<BackendResult<Vec<_>>>()?;
        let result = match kind {
            PrimitiveKind::Plus => op_binary(&operands, |a, b| a + b)?,
            PrimitiveKind::Minus => op_binary(&operands, |a, b| a - b)?,
            PrimitiveKind::ElementTimes => op_binary(&operands, |a, b| a * b)?,
            PrimitiveKind::Times => op_times(&operands, &input_shapes)?,
            PrimitiveKind::Negate => op_unary(&operands, |x| -x)?,
            PrimitiveKind::Relu => op_unary(&operands, |x| x.max(0.0))?,
            PrimitiveKind::Sigmoid => op_unary(&operands, |x| 1.0 / (1.0 + (-x).exp()))?,
            PrimitiveKind::Tanh => op_unary(&operands, f64::tanh)?,
            PrimitiveKind::Exp => op_unary(&operands, f64::exp)?,
            PrimitiveKind::Log => op_unary(&operands, f64::ln)?,
            PrimitiveKind::ReduceSum => vec![expect_single(&operands)?.iter().sum()],
            PrimitiveKind::Identity => expect_single(&operands)?.to_vec(),
            PrimitiveKind::Combine => {
                return Err(BackendError::execution("combine outputs are passed through"))
            }
            PrimitiveKind::Dropout => {
                let input = expect_single(&operands)?.to_vec();
                let node = self.node_mut(id)?;
                let state = node
                    .dropout
                    .as_mut()
                    .ok_or_else(|| BackendError::execution("dropout node without state"))?;
                op_dropout(&input, state)
            }
        };
        if result.len() != shape.num_elements() {
            return Err(BackendError::execution(format!(
                "{} produced {} elements for shape {shape}",
                self.node(id)?.name,
                result.len()
            )));
        }
        self.node_mut(id)?.value = Some(result);
        Ok(())
    }

    /// Gradient contributions of one node to each of its inputs.
    fn propagate(&self, id: NodeId) -> BackendResult<Vec<(NodeId, Vec<f64>)>> {
        let node = self.node(id)?;
        let (kind, inputs) = match &node.kind {
            NodeKind::Leaf(_) => return Ok(Vec::new()),
            NodeKind::Compute { kind, inputs, .. } => (*kind, inputs),
        };
        let Some(gradient) = node.gradient.as_deref() else {
            return Ok(Vec::new());
        };
        if kind == PrimitiveKind::Combine {
            let mut flows = Vec::new();
            for input in node.dependencies() {
                if self.node(*input)?.needs_gradient {
                    flows.push((*input, gradient.to_vec()));
                }
            }
            return Ok(flows);
        }
        let output = node
            .value
            .as_deref()
            .ok_or_else(|| BackendError::execution(format!("{} was not evaluated", node.name)))?;
        let operands = self.input_values(inputs)?;

        let contributions: Vec<Vec<f64>> = match kind {
            PrimitiveKind::Plus => vec![
                reduce_to(gradient, operands[0].len()),
                reduce_to(gradient, operands[1].len()),
            ],
            PrimitiveKind::Minus => vec![
                reduce_to(gradient, operands[0].len()),
                reduce_to(&gradient.iter().map(|g| -g).collect::<Vec<_>>(), operands[1].len()),
            ],
            PrimitiveKind::ElementTimes => {
                let (a, b) = (operands[0], operands[1]);
                let da: Vec<f64> = (0..gradient.len()).map(|i| gradient[i] * at(b, i)).collect();
                let db: Vec<f64> = (0..gradient.len()).map(|i| gradient[i] * at(a, i)).collect();
                vec![reduce_to(&da, a.len()), reduce_to(&db, b.len())]
            }
            PrimitiveKind::Times => {
                let lhs_shape = &self.node(inputs[0])?.shape;
                let rhs_shape = &self.node(inputs[1])?.shape;
                let (m, k) = (lhs_shape.dims()[0], lhs_shape.dims()[1]);
                let n = rhs_shape.dims()[1];
                let (a, b) = (operands[0], operands[1]);
                let mut da = vec![0.0; m * k];
                let mut db = vec![0.0; k * n];
                for i in 0..m {
                    for j in 0..n {
                        let g = gradient[i * n + j];
                        for p in 0..k {
                            da[i * k + p] += g * b[p * n + j];
                            db[p * n + j] += a[i * k + p] * g;
                        }
                    }
                }
                vec![da, db]
            }
            PrimitiveKind::Negate => vec![gradient.iter().map(|g| -g).collect()],
            PrimitiveKind::Relu => vec![gradient
                .iter()
                .zip(operands[0])
                .map(|(g, x)| if *x > 0.0 { *g } else { 0.0 })
                .collect()],
            PrimitiveKind::Sigmoid => vec![gradient
                .iter()
                .zip(output)
                .map(|(g, y)| g * y * (1.0 - y))
                .collect()],
            PrimitiveKind::Tanh => vec![gradient
                .iter()
                .zip(output)
                .map(|(g, y)| g * (1.0 - y * y))
                .collect()],
            PrimitiveKind::Exp => vec![gradient.iter().zip(output).map(|(g, y)| g * y).collect()],
            PrimitiveKind::Log => vec![gradient
                .iter()
                .zip(operands[0])
                .map(|(g, x)| g / x)
                .collect()],
            PrimitiveKind::ReduceSum => vec![vec![gradient[0]; operands[0].len()]],
            PrimitiveKind::Identity => vec![gradient.to_vec()],
            PrimitiveKind::Dropout => {
                let mask = node
                    .dropout
                    .as_ref()
                    .map(|state| state.mask.as_slice())
                    .ok_or_else(|| BackendError::execution("dropout node without state"))?;
                vec![gradient.iter().zip(mask).map(|(g, m)| g * m).collect()]
            }
            PrimitiveKind::Combine => Vec::new(),
        };

        let mut flows = Vec::with_capacity(inputs.len());
        for (input, contribution) in inputs.iter().zip(contributions) {
            if self.node(*input)?.needs_gradient {
                flows.push((*input, contribution));
            }
        }
        Ok(flows)
    }
}

impl ComputationNetwork for CpuNetwork {
    fn add_leaf(&mut self, leaf: LeafSpec<'_>, value: Option<&Tensor>) -> BackendResult<NodeId> {
        let value = match value {
            Some(tensor) => {
                check_fits(leaf.name, &leaf.shape, tensor)?;
                Some(tensor.to_f64_vec())
            }
            None => None,
        };
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: leaf.name.to_string(),
            kind: NodeKind::Leaf(leaf.role),
            shape: leaf.shape,
            dtype: leaf.dtype,
            needs_gradient: leaf.needs_gradient && leaf.dtype.is_float(),
            allocated: false,
            value,
            gradient: None,
            dropout: None,
        });
        trace!(node = id.0, name = leaf.name, "added leaf");
        Ok(id)
    }

    fn build_node(&mut self, node: NodeSpec<'_>, inputs: &[NodeId]) -> BackendResult<NodeId> {
        if let Some(arity) = node.kind.arity() {
            if inputs.len() != arity {
                return Err(BackendError::execution(format!(
                    "{} expects {arity} inputs, got {}",
                    node.name,
                    inputs.len()
                )));
            }
        }
        let mut needs_gradient = false;
        for input in inputs {
            needs_gradient |= self.node(*input)?.needs_gradient;
        }
        let dropout = match node.kind {
            PrimitiveKind::Dropout => Some(dropout_state(node.name, node.attributes)?),
            _ => None,
        };
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: node.name.to_string(),
            kind: NodeKind::Compute {
                kind: node.kind,
                output_index: node.output_index,
                inputs: inputs.to_vec(),
            },
            shape: node.shape,
            dtype: node.dtype,
            needs_gradient: needs_gradient && node.dtype.is_float(),
            allocated: false,
            value: None,
            gradient: None,
            dropout,
        });
        trace!(node = id.0, name = node.name, kind = node.kind.name(), "built node");
        Ok(id)
    }

    fn allocate(&mut self, roots: &[NodeId]) -> BackendResult<()> {
        let reachable = self.reachable(roots)?;
        let mut fresh = 0usize;
        for id in reachable {
            let node = self.node_mut(id)?;
            if !node.allocated {
                node.allocated = true;
                fresh += 1;
            }
        }
        if fresh > 0 {
            debug!(nodes = fresh, "allocated node storage");
        }
        Ok(())
    }

    fn set_value(&mut self, id: NodeId, value: &Tensor) -> BackendResult<()> {
        let node = self.node_mut(id)?;
        match node.kind {
            NodeKind::Leaf(LeafRole::Input | LeafRole::Parameter) => {}
            NodeKind::Leaf(LeafRole::Constant) => {
                return Err(BackendError::execution(format!(
                    "{} is a constant and cannot be reassigned",
                    node.name
                )))
            }
            NodeKind::Compute { .. } => {
                return Err(BackendError::execution(format!(
                    "{} is computed and cannot be assigned",
                    node.name
                )))
            }
        }
        check_fits(&node.name, &node.shape, value)?;
        node.value = Some(value.to_f64_vec());
        Ok(())
    }

    fn forward(&mut self, roots: &[NodeId]) -> BackendResult<()> {
        for root in roots {
            if !self.node(*root)?.allocated {
                return Err(BackendError::Unallocated(*root));
            }
        }
        let mut order: Vec<NodeId> = self.reachable(roots)?.into_iter().collect();
        order.sort();
        for id in &order {
            self.evaluate(*id)?;
        }
        self.forward_runs += 1;
        trace!(nodes = order.len(), run = self.forward_runs, "forward pass");
        Ok(())
    }

    fn backward(&mut self, seeds: &[(NodeId, Tensor)], targets: &[NodeId]) -> BackendResult<()> {
        for node in &mut self.nodes {
            node.gradient = None;
        }
        for (id, seed) in seeds {
            let node = self.node_mut(*id)?;
            if node.value.is_none() {
                return Err(BackendError::execution(format!(
                    "{} has not been evaluated",
                    node.name
                )));
            }
            check_fits(&node.name, &node.shape, seed)?;
            accumulate(&mut node.gradient, &seed.to_f64_vec());
        }

        let reachable = self.reachable(&seeds.iter().map(|(id, _)| *id).collect::<Vec<_>>())?;
        let mut order: Vec<NodeId> = reachable.into_iter().collect();
        order.sort_by(|a, b| b.cmp(a));
        for id in order {
            if !self.node(id)?.needs_gradient {
                continue;
            }
            for (input, contribution) in self.propagate(id)? {
                accumulate(&mut self.node_mut(input)?.gradient, &contribution);
            }
        }

        for target in targets {
            let node = self.node_mut(*target)?;
            if !node.needs_gradient {
                return Err(BackendError::execution(format!(
                    "{} does not take gradients",
                    node.name
                )));
            }
            if node.gradient.is_none() {
                node.gradient = Some(vec![0.0; node.shape.num_elements()]);
            }
        }
        Ok(())
    }

    fn read(&self, id: NodeId) -> BackendResult<Tensor> {
        let node = self.node(id)?;
        let values = node
            .value
            .clone()
            .ok_or_else(|| BackendError::execution(format!("{} has no value", node.name)))?;
        to_tensor(node, values)
    }

    fn read_gradient(&self, id: NodeId) -> BackendResult<Tensor> {
        let node = self.node(id)?;
        let values = node
            .gradient
            .clone()
            .ok_or_else(|| BackendError::execution(format!("{} has no gradient", node.name)))?;
        to_tensor(node, values)
    }

    fn internal_state(&self, id: NodeId) -> BackendResult<Option<StatefulNodeState>> {
        Ok(self.node(id)?.dropout.as_ref().map(|state| StatefulNodeState {
            rng_seed: state.seed,
            rng_offset: state.offset,
        }))
    }

    fn set_internal_state(&mut self, id: NodeId, state: StatefulNodeState) -> BackendResult<()> {
        let node = self.node_mut(id)?;
        let name = node.name.clone();
        let dropout = node
            .dropout
            .as_mut()
            .ok_or_else(|| BackendError::execution(format!("{name} has no internal state")))?;
        dropout.seed = state.rng_seed;
        dropout.offset = state.rng_offset;
        Ok(())
    }
}

fn dropout_state(name: &str, attrs: &Dictionary) -> BackendResult<DropoutState> {
    let rate = attrs
        .get(attributes::DROPOUT_RATE)
        .and_then(|value| value.as_f64())
        .ok_or_else(|| BackendError::execution(format!("{name} has no dropout rate")))?;
    let read = |key: &str| attrs.get(key).and_then(|value| value.as_u64()).unwrap_or(0);
    Ok(DropoutState {
        rate,
        seed: read(attributes::RNG_SEED),
        offset: read(attributes::RNG_OFFSET),
        mask: Vec::new(),
    })
}

fn check_fits(name: &str, shape: &Shape, tensor: &Tensor) -> BackendResult<()> {
    if tensor.shape() != shape {
        return Err(BackendError::execution(format!(
            "{name} expects shape {shape}, got {}",
            tensor.shape()
        )));
    }
    Ok(())
}

fn to_tensor(node: &Node, values: Vec<f64>) -> BackendResult<Tensor> {
    Tensor::from_f64(node.shape.clone(), node.dtype, values)
        .map_err(|err| BackendError::execution(format!("{}: {err}", node.name)))
}

fn accumulate(slot: &mut Option<Vec<f64>>, contribution: &[f64]) {
    match slot {
        Some(existing) => {
            for (acc, value) in existing.iter_mut().zip(contribution) {
                *acc += value;
            }
        }
        None => *slot = Some(contribution.to_vec()),
    }
}

/// Element `i` of an operand that may be broadcast from a single element.
fn at(values: &[f64], i: usize) -> f64 {
    if values.len() == 1 {
        values[0]
    } else {
        values[i]
    }
}

/// Sums a gradient back down to a broadcast operand's size.
fn reduce_to(gradient: &[f64], len: usize) -> Vec<f64> {
    if len == gradient.len() {
        gradient.to_vec()
    } else {
        vec![gradient.iter().sum(); len]
    }
}

fn expect_single<'a>(inputs: &[&'a [f64]]) -> BackendResult<&'a [f64]> {
    if inputs.len() != 1 {
        Err(BackendError::execution("operation expects single input"))
    } else {
        Ok(inputs[0])
    }
}

fn op_unary(inputs: &[&[f64]], f: impl Fn(f64) -> f64) -> BackendResult<Vec<f64>> {
    Ok(expect_single(inputs)?.iter().map(|x| f(*x)).collect())
}

fn op_binary(inputs: &[&[f64]], f: impl Fn(f64, f64) -> f64) -> BackendResult<Vec<f64>> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("elementwise binary expects 2 inputs"));
    }
    let (a, b) = (inputs[0], inputs[1]);
    let len = a.len().max(b.len());
    if (a.len() != len && a.len() != 1) || (b.len() != len && b.len() != 1) {
        return Err(BackendError::execution("elementwise size mismatch"));
    }
    Ok((0..len).map(|i| f(at(a, i), at(b, i))).collect())
}

fn op_times(inputs: &[&[f64]], shapes: &[Shape]) -> BackendResult<Vec<f64>> {
    if inputs.len() != 2 || shapes.len() != 2 {
        return Err(BackendError::execution("times expects 2 inputs"));
    }
    let (lhs, rhs) = (shapes[0].dims(), shapes[1].dims());
    if lhs.len() != 2 || rhs.len() != 2 || lhs[1] != rhs[0] {
        return Err(BackendError::execution(format!(
            "times cannot multiply {lhs:?} by {rhs:?}"
        )));
    }
    let (m, k, n) = (lhs[0], lhs[1], rhs[1]);
    let (a, b) = (inputs[0], inputs[1]);
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let left = a[i * k + p];
            for j in 0..n {
                out[i * n + j] += left * b[p * n + j];
            }
        }
    }
    Ok(out)
}

/// Draws a fresh mask from `seed + offset`, then advances the offset past it.
fn op_dropout(input: &[f64], state: &mut DropoutState) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(state.seed.wrapping_add(state.offset));
    let scale = 1.0 / (1.0 - state.rate);
    state.mask = (0..input.len())
        .map(|_| {
            if rng.gen::<f64>() < state.rate {
                0.0
            } else {
                scale
            }
        })
        .collect();
    state.offset = state.offset.wrapping_add(input.len() as u64);
    input.iter().zip(&state.mask).map(|(x, m)| x * m).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(network: &mut CpuNetwork, name: &str, values: Vec<f32>, grad: bool) -> NodeId {
        let shape = Shape::new([values.len()]);
        let tensor = Tensor::from_vec(shape.clone(), values).unwrap();
        network
            .add_leaf(
                LeafSpec {
                    name,
                    role: LeafRole::Parameter,
                    shape,
                    dtype: DType::F32,
                    needs_gradient: grad,
                },
                Some(&tensor),
            )
            .unwrap()
    }

    fn compute(
        network: &mut CpuNetwork,
        kind: PrimitiveKind,
        inputs: &[NodeId],
        len: usize,
        attrs: &Dictionary,
    ) -> NodeId {
        network
            .build_node(
                NodeSpec {
                    name: kind.name(),
                    kind,
                    output_index: 0,
                    attributes: attrs,
                    shape: Shape::new([len]),
                    dtype: DType::F32,
                },
                inputs,
            )
            .unwrap()
    }

    #[test]
    fn rejects_accelerator_devices() {
        assert!(CpuBackend.create_network(Device::Accelerator(0)).is_err());
        assert!(CpuBackend.create_network(Device::Cpu).is_ok());
    }

    #[test]
    fn forward_requires_allocation() {
        let mut network = CpuNetwork::default();
        let a = leaf(&mut network, "a", vec![1.0, 2.0], false);
        let y = compute(&mut network, PrimitiveKind::Negate, &[a], 2, &Dictionary::new());
        assert_eq!(network.forward(&[y]), Err(BackendError::Unallocated(y)));

        network.allocate(&[y]).unwrap();
        network.forward(&[y]).unwrap();
        assert_eq!(network.read(y).unwrap().to_f64_vec(), vec![-1.0, -2.0]);
    }

    #[test]
    fn product_gradients_with_scalar_broadcast() {
        let mut network = CpuNetwork::default();
        let a = leaf(&mut network, "a", vec![3.0], true);
        let x = leaf(&mut network, "x", vec![1.0, 2.0], true);
        let attrs = Dictionary::new();
        let ax = compute(&mut network, PrimitiveKind::ElementTimes, &[a, x], 2, &attrs);
        let sum = compute(&mut network, PrimitiveKind::ReduceSum, &[ax], 1, &attrs);
        network.allocate(&[sum]).unwrap();
        network.forward(&[sum]).unwrap();
        assert_eq!(network.read(sum).unwrap().to_f64_vec(), vec![9.0]);

        network
            .backward(&[(sum, Tensor::scalar(1.0))], &[a, x])
            .unwrap();
        assert_eq!(network.read_gradient(a).unwrap().to_f64_vec(), vec![3.0]);
        assert_eq!(network.read_gradient(x).unwrap().to_f64_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn dropout_offset_advances_per_forward() {
        let mut network = CpuNetwork::default();
        let x = leaf(&mut network, "x", vec![1.0; 8], false);
        let mut attrs = Dictionary::new();
        attrs.insert(attributes::DROPOUT_RATE.into(), 0.5.into());
        attrs.insert(attributes::RNG_SEED.into(), 7u64.into());
        let y = compute(&mut network, PrimitiveKind::Dropout, &[x], 8, &attrs);
        network.allocate(&[y]).unwrap();

        network.forward(&[y]).unwrap();
        let first = network.read(y).unwrap().to_f64_vec();
        assert_eq!(
            network.internal_state(y).unwrap(),
            Some(StatefulNodeState {
                rng_seed: 7,
                rng_offset: 8
            })
        );
        assert!(first.iter().all(|v| *v == 0.0 || *v == 2.0));

        network
            .set_internal_state(
                y,
                StatefulNodeState {
                    rng_seed: 7,
                    rng_offset: 0,
                },
            )
            .unwrap();
        network.forward(&[y]).unwrap();
        assert_eq!(network.read(y).unwrap().to_f64_vec(), first);
    }

    #[test]
    fn constants_cannot_be_reassigned() {
        let mut network = CpuNetwork::default();
        let c = network
            .add_leaf(
                LeafSpec {
                    name: "c",
                    role: LeafRole::Constant,
                    shape: Shape::new([1]),
                    dtype: DType::F32,
                    needs_gradient: false,
                },
                Some(&Tensor::scalar(4.0)),
            )
            .unwrap();
        let p = leaf(&mut network, "p", vec![1.0], true);

        assert!(network.set_value(c, &Tensor::scalar(5.0)).is_err());
        assert_eq!(network.read(c).unwrap().to_f64_vec(), vec![4.0]);
        network.set_value(p, &Tensor::scalar(5.0)).unwrap();
        assert_eq!(network.read(p).unwrap().to_f64_vec(), vec![5.0]);
    }

    #[test]
    fn stateless_nodes_report_no_state() {
        let mut network = CpuNetwork::default();
        let x = leaf(&mut network, "x", vec![1.0], false);
        assert_eq!(network.internal_state(x).unwrap(), None);
        assert!(network
            .set_internal_state(x, StatefulNodeState::default())
            .is_err());
    }
}
