//! Contract between the graph core and an execution engine.
//!
//! The core never computes anything numeric. It asks a [`PortableBackend`] for a fresh
//! [`ComputationNetwork`], adds one engine node per symbolic variable, and then drives that
//! network through forward and backward passes. Engines own their buffers; the core only
//! moves host [`Tensor`]s across this boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::{Dictionary, PrimitiveKind};
use crate::tensor::{DType, Shape, Tensor};

/// Identifies an engine node within one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Device a network is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(index) => write!(f, "accelerator:{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafRole {
    Input,
    Parameter,
    Constant,
}

/// Describes an externally supplied node.
#[derive(Debug, Clone)]
pub struct LeafSpec<'a> {
    pub name: &'a str,
    pub role: LeafRole,
    pub shape: Shape,
    pub dtype: DType,
    /// Whether backward should produce a gradient for this leaf.
    pub needs_gradient: bool,
}

/// Describes one output of a primitive operation.
#[derive(Debug, Clone)]
pub struct NodeSpec<'a> {
    pub name: &'a str,
    pub kind: PrimitiveKind,
    /// Which output of a multi-output primitive this node computes.
    pub output_index: usize,
    pub attributes: &'a Dictionary,
    pub shape: Shape,
    pub dtype: DType,
}

/// Persistent state carried by randomized nodes across evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatefulNodeState {
    pub rng_seed: u64,
    pub rng_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
    UnknownNode(NodeId),
    Unallocated(NodeId),
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::UnknownNode(node) => write!(f, "unknown network node {}", node.0),
            BackendError::Unallocated(node) => {
                write!(f, "storage for network node {} is not allocated", node.0)
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Factory for executable networks on a given device.
pub trait PortableBackend: Send + Sync {
    type Network: ComputationNetwork;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Creates an empty network bound to `device`.
    fn create_network(&self, device: Device) -> BackendResult<Self::Network>;
}

/// An executable network under construction or ready to run.
///
/// Nodes are added incrementally; an input node is always added before any node that
/// consumes it, so `NodeId` order is a valid topological order.
pub trait ComputationNetwork: Send {
    /// Adds an externally supplied node, optionally with an initial value.
    fn add_leaf(&mut self, leaf: LeafSpec<'_>, value: Option<&Tensor>) -> BackendResult<NodeId>;

    /// Adds a computed node wired to already built `inputs`.
    fn build_node(&mut self, node: NodeSpec<'_>, inputs: &[NodeId]) -> BackendResult<NodeId>;

    /// Materializes buffers for everything `roots` depend on. Repeated calls are cheap.
    fn allocate(&mut self, roots: &[NodeId]) -> BackendResult<()>;

    /// Overwrites the value of a leaf node.
    fn set_value(&mut self, node: NodeId, value: &Tensor) -> BackendResult<()>;

    /// Evaluates `roots` and everything they depend on.
    fn forward(&mut self, roots: &[NodeId]) -> BackendResult<()>;

    /// Propagates `seeds` back through the state of the last forward, producing gradients
    /// for `targets`.
    fn backward(&mut self, seeds: &[(NodeId, Tensor)], targets: &[NodeId]) -> BackendResult<()>;

    fn read(&self, node: NodeId) -> BackendResult<Tensor>;

    fn read_gradient(&self, node: NodeId) -> BackendResult<Tensor>;

    /// State of a stateful node, `None` for stateless ones.
    fn internal_state(&self, node: NodeId) -> BackendResult<Option<StatefulNodeState>>;

    fn set_internal_state(&mut self, node: NodeId, state: StatefulNodeState)
        -> BackendResult<()>;
}
