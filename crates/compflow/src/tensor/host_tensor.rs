//! Host-backed tensor used for arguments, results, parameters and serialized values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{dtype::DType, shape::Shape};

/// Typed element storage. The variant always agrees with the tensor's dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::F64(values) => values.len(),
            TensorData::I32(values) => values.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("tensor data length ({len}) does not match shape {shape}")]
    LengthMismatch { len: usize, shape: Shape },
    #[error("tensor shape must have at least one dimension")]
    EmptyShape,
}

/// Dense host tensor tagged with its element type.
///
/// Values are serialized as `{dtype, shape, data}` with the payload widened to `f64`, which
/// is lossless for every supported dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorRecord", into = "TensorRecord")]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
}

impl Tensor {
    /// Constructs an `F32` tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self, TensorError> {
        Self::from_data(shape, TensorData::F32(data))
    }

    /// Constructs an `F64` tensor.
    pub fn from_f64_vec(shape: Shape, data: Vec<f64>) -> Result<Self, TensorError> {
        Self::from_data(shape, TensorData::F64(data))
    }

    /// Constructs an `I32` tensor, ensuring the payload matches the expected element count.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> Result<Self, TensorError> {
        Self::from_data(shape, TensorData::I32(data))
    }

    pub fn from_data(shape: Shape, data: TensorData) -> Result<Self, TensorError> {
        if data.len() != shape.num_elements() {
            return Err(TensorError::LengthMismatch {
                len: data.len(),
                shape,
            });
        }
        Ok(Tensor { shape, data })
    }

    /// Narrows `f64` values into a tensor of the requested dtype.
    ///
    /// Engines compute in `f64` and use this to hand results back in the declared dtype.
    pub fn from_f64(shape: Shape, dtype: DType, values: Vec<f64>) -> Result<Self, TensorError> {
        let data = match dtype {
            DType::F32 => TensorData::F32(values.into_iter().map(|v| v as f32).collect()),
            DType::F64 => TensorData::F64(values),
            DType::I32 => TensorData::I32(values.into_iter().map(|v| v.round() as i32).collect()),
        };
        Self::from_data(shape, data)
    }

    /// Returns a zero-initialized tensor of the requested shape and dtype.
    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        Self::filled(shape, dtype, 0.0)
    }

    /// Returns a one-initialized tensor of the requested shape and dtype.
    pub fn ones(shape: Shape, dtype: DType) -> Self {
        Self::filled(shape, dtype, 1.0)
    }

    fn filled(shape: Shape, dtype: DType, value: f64) -> Self {
        let len = shape.num_elements();
        let data = match dtype {
            DType::F32 => TensorData::F32(vec![value as f32; len]),
            DType::F64 => TensorData::F64(vec![value; len]),
            DType::I32 => TensorData::I32(vec![value as i32; len]),
        };
        Tensor { shape, data }
    }

    /// Single-element `F32` tensor.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Shape::scalar(),
            data: TensorData::F32(vec![value]),
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provides access to the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the scalar dtype of the tensor payload.
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Borrows the payload as `f32` values when the dtype is `F32`.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    /// Copies the payload widened to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            TensorData::F32(values) => values.iter().map(|&v| f64::from(v)).collect(),
            TensorData::F64(values) => values.clone(),
            TensorData::I32(values) => values.iter().map(|&v| f64::from(v)).collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TensorRecord {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl From<Tensor> for TensorRecord {
    fn from(tensor: Tensor) -> Self {
        TensorRecord {
            dtype: tensor.dtype(),
            data: tensor.to_f64_vec(),
            shape: tensor.shape.dims().to_vec(),
        }
    }
}

impl TryFrom<TensorRecord> for Tensor {
    type Error = TensorError;

    fn try_from(record: TensorRecord) -> Result<Self, Self::Error> {
        let shape = Shape::try_new(record.shape).ok_or(TensorError::EmptyShape)?;
        Tensor::from_f64(shape, record.dtype, record.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_length_mismatch() {
        let err = Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, TensorError::LengthMismatch { len: 3, .. }));
    }

    #[test]
    fn json_encoding_keeps_dtype() {
        let tensor = Tensor::from_i32(Shape::new([3]), vec![-1, 0, 7]).unwrap();
        let encoded = serde_json::to_value(&tensor).unwrap();
        assert_eq!(encoded["dtype"], "I32");
        let decoded: Tensor = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, tensor);
    }

    #[test]
    fn json_decoding_rejects_empty_shape() {
        let raw = serde_json::json!({"dtype": "F32", "shape": [], "data": []});
        assert!(serde_json::from_value::<Tensor>(raw).is_err());
    }
}
