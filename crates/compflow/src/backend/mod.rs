//! Execution engine boundary.

pub mod spec;

pub use spec::{
    BackendError, BackendResult, ComputationNetwork, Device, LeafRole, LeafSpec, NodeId, NodeSpec,
    PortableBackend, StatefulNodeState,
};
