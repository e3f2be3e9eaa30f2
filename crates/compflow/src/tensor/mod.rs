//! Host tensor abstractions shared between the graph core and execution engines.
//!
//! Every tensor carries an explicit [`DType`] tag; engines dispatch on it at runtime rather
//! than through per-dtype specializations of the graph code.

pub mod dtype;
mod host_tensor;
pub mod shape;
mod value;

pub use dtype::DType;
pub use host_tensor::{Tensor, TensorData, TensorError};
pub use shape::Shape;
pub use value::{Value, WeakValue};
