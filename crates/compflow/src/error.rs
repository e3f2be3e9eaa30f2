//! Error taxonomy for graph construction, compilation, evaluation and serialization.

use thiserror::Error;

use crate::backend::spec::BackendError;
use crate::tensor::{DType, Shape, TensorError};

/// Convenience alias for results returned by graph routines.
pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("malformed graph: {0}")]
    Structural(#[from] StructuralError),
    #[error("invalid usage: {0}")]
    Usage(#[from] UsageError),
    #[error("unsupported serialization version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u64, supported: u64 },
    #[error("malformed graph document: {0}")]
    Format(String),
    #[error("engine failure while {context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl GraphError {
    pub(crate) fn engine(context: impl Into<String>) -> impl FnOnce(BackendError) -> GraphError {
        let context = context.into();
        move |source| GraphError::Engine { context, source }
    }

    pub(crate) fn format(message: impl Into<String>) -> Self {
        GraphError::Format(message.into())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Format(err.to_string())
    }
}

/// The graph itself is malformed and cannot be compiled or evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("placeholder {placeholder} is unresolved on a compiled path")]
    UnresolvedPlaceholder { placeholder: String },
    #[error("root operation {operation} has no outputs")]
    RootWithoutOutputs { operation: String },
    #[error("cycle detected through {variable}")]
    CycleDetected { variable: String },
    #[error("{operation}: {detail}")]
    ShapeMismatch { operation: String, detail: String },
    #[error("shape of {variable} is unknown at compile time")]
    UnknownShape { variable: String },
    #[error("{operation} expects {expected} inputs, got {found}")]
    InvalidArity {
        operation: String,
        expected: usize,
        found: usize,
    },
    #[error("{operation}: invalid attribute: {detail}")]
    InvalidAttribute { operation: String, detail: String },
    #[error("{variable} is not part of the compiled network")]
    NotCompiled { variable: String },
    #[error("{variable} belongs to a different graph arena")]
    ForeignArena { variable: String },
}

/// A caller broke a usage contract of the public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("backprop handle is stale: parameter {parameter} moved from timestamp {recorded} to {current}")]
    StaleHandle {
        parameter: String,
        recorded: u64,
        current: u64,
    },
    #[error("backprop handle was superseded by a later evaluation of {variable}")]
    SupersededHandle { variable: String },
    #[error("backprop handle was produced by a different composite graph")]
    ForeignHandle,
    #[error("required argument {variable} was not supplied")]
    MissingArgument { variable: String },
    #[error("{variable} is not an input of this graph")]
    NotAnInput { variable: String },
    #[error("{variable} is not an output of this graph")]
    NotAnOutput { variable: String },
    #[error("value for {variable} has shape {found_shape} ({found_dtype:?}), expected {expected_shape} ({expected_dtype:?})")]
    ArgumentMismatch {
        variable: String,
        expected_shape: Shape,
        expected_dtype: DType,
        found_shape: Shape,
        found_dtype: DType,
    },
    #[error("{variable} is not a parameter")]
    NotAParameter { variable: String },
    #[error("{variable} is not a placeholder of this graph")]
    NotAPlaceholder { variable: String },
    #[error("no gradient can be computed for {variable}")]
    GradientNotAvailable { variable: String },
    #[error("value was erased by a later evaluation")]
    ErasedValue,
    #[error("{variable} was not retained for backpropagation")]
    InvalidRetainRoot { variable: String },
    #[error("{0} requires at least one entry")]
    EmptyRequest(&'static str),
    #[error("internal state mismatch: {0}")]
    IncompatibleState(String),
}
