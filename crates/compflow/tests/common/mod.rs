#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use compflow::backend::spec::{
    BackendError, BackendResult, ComputationNetwork, Device, LeafSpec, NodeId, NodeSpec,
    PortableBackend, StatefulNodeState,
};
use compflow::{Shape, Tensor, Value, Variable};
use compflow_backend_ref_cpu::{CpuBackend, CpuNetwork};

/// CPU backend that counts how many networks it was asked to build.
#[derive(Default)]
pub struct CountingBackend {
    inner: CpuBackend,
    networks: AtomicUsize,
}

impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn networks_created(&self) -> usize {
        self.networks.load(Ordering::SeqCst)
    }
}

impl PortableBackend for CountingBackend {
    type Network = CpuNetwork;

    fn backend_name(&self) -> &str {
        "counting-cpu"
    }

    fn create_network(&self, device: Device) -> BackendResult<CpuNetwork> {
        self.networks.fetch_add(1, Ordering::SeqCst);
        self.inner.create_network(device)
    }
}

/// Switches shared between a [`FaultyBackend`] and every network it creates.
#[derive(Default)]
pub struct Faults {
    forward: AtomicBool,
    backward: AtomicBool,
}

impl Faults {
    pub fn fail_forward(&self, enabled: bool) {
        self.forward.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_backward(&self, enabled: bool) {
        self.backward.store(enabled, Ordering::SeqCst);
    }
}

/// CPU backend whose networks fail on demand after their inputs were written.
#[derive(Default)]
pub struct FaultyBackend {
    inner: CpuBackend,
    faults: Arc<Faults>,
}

impl FaultyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

impl PortableBackend for FaultyBackend {
    type Network = FaultyNetwork;

    fn backend_name(&self) -> &str {
        "faulty-cpu"
    }

    fn create_network(&self, device: Device) -> BackendResult<FaultyNetwork> {
        Ok(FaultyNetwork {
            inner: self.inner.create_network(device)?,
            faults: Arc::clone(&self.faults),
        })
    }
}

pub struct FaultyNetwork {
    inner: CpuNetwork,
    faults: Arc<Faults>,
}

impl ComputationNetwork for FaultyNetwork {
    fn add_leaf(&mut self, leaf: LeafSpec<'_>, value: Option<&Tensor>) -> BackendResult<NodeId> {
        self.inner.add_leaf(leaf, value)
    }

    fn build_node(&mut self, node: NodeSpec<'_>, inputs: &[NodeId]) -> BackendResult<NodeId> {
        self.inner.build_node(node, inputs)
    }

    fn allocate(&mut self, roots: &[NodeId]) -> BackendResult<()> {
        self.inner.allocate(roots)
    }

    fn set_value(&mut self, node: NodeId, value: &Tensor) -> BackendResult<()> {
        self.inner.set_value(node, value)
    }

    fn forward(&mut self, roots: &[NodeId]) -> BackendResult<()> {
        if self.faults.forward.load(Ordering::SeqCst) {
            return Err(BackendError::execution("kernel failed"));
        }
        self.inner.forward(roots)
    }

    fn backward(&mut self, seeds: &[(NodeId, Tensor)], targets: &[NodeId]) -> BackendResult<()> {
        if self.faults.backward.load(Ordering::SeqCst) {
            return Err(BackendError::execution("kernel failed"));
        }
        self.inner.backward(seeds, targets)
    }

    fn read(&self, node: NodeId) -> BackendResult<Tensor> {
        self.inner.read(node)
    }

    fn read_gradient(&self, node: NodeId) -> BackendResult<Tensor> {
        self.inner.read_gradient(node)
    }

    fn internal_state(&self, node: NodeId) -> BackendResult<Option<StatefulNodeState>> {
        self.inner.internal_state(node)
    }

    fn set_internal_state(
        &mut self,
        node: NodeId,
        state: StatefulNodeState,
    ) -> BackendResult<()> {
        self.inner.set_internal_state(node, state)
    }
}

pub fn vector(values: &[f32]) -> Tensor {
    Tensor::from_vec(Shape::new([values.len()]), values.to_vec())
        .expect("vector length matches its shape")
}

pub fn arguments(pairs: &[(&Variable, Tensor)]) -> HashMap<Variable, Tensor> {
    pairs
        .iter()
        .map(|(var, tensor)| ((*var).clone(), tensor.clone()))
        .collect()
}

pub fn request(vars: &[&Variable]) -> HashMap<Variable, Option<Value>> {
    vars.iter().map(|var| ((*var).clone(), None)).collect()
}

pub fn set_of(vars: &[&Variable]) -> HashSet<Variable> {
    vars.iter().map(|var| (*var).clone()).collect()
}

pub fn values_of(map: &HashMap<Variable, Option<Value>>, var: &Variable) -> Result<Vec<f64>> {
    let value = map
        .get(var)
        .and_then(Option::as_ref)
        .ok_or_else(|| anyhow!("no value for {}", var.uid()))?;
    Ok(value.to_f64_vec()?)
}

pub fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{actual:?} vs {expected:?}");
    }
}
