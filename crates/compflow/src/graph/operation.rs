//! Primitive operation kinds and their shape rules.

use serde::{Deserialize, Serialize};

use crate::error::StructuralError;
use crate::tensor::{DType, Shape};

/// Attribute dictionary attached to every operation.
pub type Dictionary = serde_json::Map<String, serde_json::Value>;

/// Attribute keys with meaning to the core.
pub mod attributes {
    pub const DROPOUT_RATE: &str = "dropout_rate";
    pub const RNG_SEED: &str = "rng_seed";
    pub const RNG_OFFSET: &str = "rng_offset";
}

/// Computations delegated to the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Plus,
    Minus,
    ElementTimes,
    /// Rank-2 matrix product `[m, k] x [k, n] -> [m, n]`.
    Times,
    Negate,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Log,
    /// Sums every element into a single-element tensor.
    ReduceSum,
    Identity,
    /// Randomized masking; carries `rng_seed`/`rng_offset` state across evaluations.
    Dropout,
    /// Groups N variables under one root; output `i` passes input `i` through.
    Combine,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 14] = [
        PrimitiveKind::Plus,
        PrimitiveKind::Minus,
        PrimitiveKind::ElementTimes,
        PrimitiveKind::Times,
        PrimitiveKind::Negate,
        PrimitiveKind::Relu,
        PrimitiveKind::Sigmoid,
        PrimitiveKind::Tanh,
        PrimitiveKind::Exp,
        PrimitiveKind::Log,
        PrimitiveKind::ReduceSum,
        PrimitiveKind::Identity,
        PrimitiveKind::Dropout,
        PrimitiveKind::Combine,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Plus => "Plus",
            PrimitiveKind::Minus => "Minus",
            PrimitiveKind::ElementTimes => "ElementTimes",
            PrimitiveKind::Times => "Times",
            PrimitiveKind::Negate => "Negate",
            PrimitiveKind::Relu => "ReLU",
            PrimitiveKind::Sigmoid => "Sigmoid",
            PrimitiveKind::Tanh => "Tanh",
            PrimitiveKind::Exp => "Exp",
            PrimitiveKind::Log => "Log",
            PrimitiveKind::ReduceSum => "ReduceSum",
            PrimitiveKind::Identity => "Identity",
            PrimitiveKind::Dropout => "Dropout",
            PrimitiveKind::Combine => "Combine",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Exact input count, or `None` for variadic kinds.
    pub fn arity(self) -> Option<usize> {
        match self {
            PrimitiveKind::Plus
            | PrimitiveKind::Minus
            | PrimitiveKind::ElementTimes
            | PrimitiveKind::Times => Some(2),
            PrimitiveKind::Combine => None,
            _ => Some(1),
        }
    }

    pub fn is_stateful(self) -> bool {
        matches!(self, PrimitiveKind::Dropout)
    }

    /// Reorders the first two operands for kinds whose natural operand order differs from
    /// declaration order.
    pub fn natural_order<T>(self, operands: &mut [T]) {
        if self == PrimitiveKind::Times && operands.len() >= 2 {
            operands.swap(0, 1);
        }
    }

    /// Derives output shapes and dtypes. Unknown input shapes yield unknown output shapes.
    pub(crate) fn infer(
        self,
        operation: &str,
        inputs: &[(Option<Shape>, DType)],
    ) -> Result<Vec<(Option<Shape>, DType)>, StructuralError> {
        match self.arity() {
            Some(expected) if expected != inputs.len() => {
                return Err(StructuralError::InvalidArity {
                    operation: operation.to_string(),
                    expected,
                    found: inputs.len(),
                })
            }
            None if inputs.is_empty() => {
                return Err(StructuralError::InvalidArity {
                    operation: operation.to_string(),
                    expected: 1,
                    found: 0,
                })
            }
            _ => {}
        }
        let mismatch = |detail: String| StructuralError::ShapeMismatch {
            operation: operation.to_string(),
            detail,
        };

        match self {
            PrimitiveKind::Combine => Ok(inputs.to_vec()),
            PrimitiveKind::Plus | PrimitiveKind::Minus | PrimitiveKind::ElementTimes => {
                let (lhs, lhs_dtype) = &inputs[0];
                let (rhs, rhs_dtype) = &inputs[1];
                if lhs_dtype != rhs_dtype {
                    return Err(mismatch(format!(
                        "operand dtypes differ: {lhs_dtype:?} vs {rhs_dtype:?}"
                    )));
                }
                let shape = match (lhs, rhs) {
                    (Some(a), Some(b)) if a == b => Some(a.clone()),
                    (Some(a), Some(b)) if b.is_scalar() => Some(a.clone()),
                    (Some(a), Some(b)) if a.is_scalar() => Some(b.clone()),
                    (Some(a), Some(b)) => {
                        return Err(mismatch(format!("cannot broadcast {a} with {b}")))
                    }
                    _ => None,
                };
                Ok(vec![(shape, *lhs_dtype)])
            }
            PrimitiveKind::Times => {
                let (lhs, lhs_dtype) = &inputs[0];
                let (rhs, rhs_dtype) = &inputs[1];
                if lhs_dtype != rhs_dtype {
                    return Err(mismatch(format!(
                        "operand dtypes differ: {lhs_dtype:?} vs {rhs_dtype:?}"
                    )));
                }
                let shape = match (lhs, rhs) {
                    (Some(a), Some(b)) => {
                        if a.rank() != 2 || b.rank() != 2 {
                            return Err(mismatch(format!("expects rank-2 operands, got {a} and {b}")));
                        }
                        if a.dims()[1] != b.dims()[0] {
                            return Err(mismatch(format!("inner dimensions differ: {a} x {b}")));
                        }
                        Some(Shape::new([a.dims()[0], b.dims()[1]]))
                    }
                    _ => None,
                };
                Ok(vec![(shape, *lhs_dtype)])
            }
            PrimitiveKind::ReduceSum => Ok(vec![(Some(Shape::scalar()), inputs[0].1)]),
            PrimitiveKind::Negate
            | PrimitiveKind::Relu
            | PrimitiveKind::Sigmoid
            | PrimitiveKind::Tanh
            | PrimitiveKind::Exp
            | PrimitiveKind::Log
            | PrimitiveKind::Identity
            | PrimitiveKind::Dropout => Ok(vec![inputs[0].clone()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(dims: &[usize]) -> (Option<Shape>, DType) {
        (Some(Shape::new(dims.to_vec())), DType::F32)
    }

    #[test]
    fn names_round_trip() {
        for kind in PrimitiveKind::ALL {
            assert_eq!(PrimitiveKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn times_checks_inner_dimension() {
        let out = PrimitiveKind::Times
            .infer("t", &[known(&[2, 3]), known(&[3, 4])])
            .unwrap();
        assert_eq!(out[0].0, Some(Shape::new([2, 4])));
        let err = PrimitiveKind::Times
            .infer("t", &[known(&[2, 3]), known(&[2, 4])])
            .unwrap_err();
        assert!(matches!(err, StructuralError::ShapeMismatch { .. }));
    }

    #[test]
    fn binary_broadcasts_single_element_operands() {
        let out = PrimitiveKind::Plus
            .infer("p", &[known(&[1]), known(&[2, 2])])
            .unwrap();
        assert_eq!(out[0].0, Some(Shape::new([2, 2])));
    }

    #[test]
    fn unknown_shapes_propagate() {
        let out = PrimitiveKind::Plus
            .infer("p", &[(None, DType::F32), known(&[3])])
            .unwrap();
        assert_eq!(out[0].0, None);
    }

    #[test]
    fn arity_is_enforced() {
        let err = PrimitiveKind::Negate
            .infer("n", &[known(&[1]), known(&[1])])
            .unwrap_err();
        assert!(matches!(err, StructuralError::InvalidArity { expected: 1, found: 2, .. }));
    }

    #[test]
    fn natural_order_swaps_matrix_operands_only() {
        let mut operands = ["w", "x"];
        PrimitiveKind::Times.natural_order(&mut operands);
        assert_eq!(operands, ["x", "w"]);
        let mut operands = ["a", "b"];
        PrimitiveKind::Plus.natural_order(&mut operands);
        assert_eq!(operands, ["a", "b"]);
    }
}
