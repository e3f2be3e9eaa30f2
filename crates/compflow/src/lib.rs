pub mod backend;
pub mod composite;
mod env;
pub mod error;
pub mod graph;
pub mod ops;
pub mod profiling;
pub mod tensor;

pub use backend::spec::{ComputationNetwork, Device, PortableBackend};
pub use composite::{BackpropState, CompositeGraph, CompositeOptions};
pub use error::{GraphError, Result, StructuralError, UsageError};
pub use graph::{Dictionary, GraphArena, Operation, PrimitiveKind, Variable, VariableKind};
pub use tensor::{DType, Shape, Tensor, Value};
