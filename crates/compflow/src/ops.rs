//! Functional constructors for graph operations.
//!
//! Each constructor records one operation in the arena of its operands and returns the
//! resulting output variable (or the operation itself when it has several outputs).

use std::sync::Arc;

use serde_json::json;

use crate::error::{Result, StructuralError, UsageError};
use crate::graph::arena::{BlockDefinition, NewOperation, OpKind};
use crate::graph::traversal::leaf_ids;
use crate::graph::{
    attributes, Dictionary, GraphArena, Operation, PrimitiveKind, Variable, VariableKind,
};

fn shared_arena<'a>(operands: &[&'a Variable]) -> Result<&'a Arc<GraphArena>> {
    let Some((&first, rest)) = operands.split_first() else {
        return Err(UsageError::EmptyRequest("operation inputs").into());
    };
    let arena = first.arena();
    for operand in rest {
        if !operand.same_arena(arena) {
            return Err(StructuralError::ForeignArena {
                variable: operand.label(),
            }
            .into());
        }
    }
    Ok(arena)
}

/// Records a primitive operation with explicit attributes.
pub fn primitive(
    kind: PrimitiveKind,
    operands: &[&Variable],
    attributes: Dictionary,
) -> Result<Operation> {
    let arena = shared_arena(operands)?;
    arena.create_operation(NewOperation {
        kind: OpKind::Primitive(kind),
        uid: None,
        name: String::new(),
        inputs: operands.iter().map(|operand| operand.id()).collect(),
        attributes,
        outputs: None,
    })
}

fn unary(kind: PrimitiveKind, x: &Variable) -> Result<Variable> {
    Ok(primitive(kind, &[x], Dictionary::new())?.output())
}

fn binary(kind: PrimitiveKind, lhs: &Variable, rhs: &Variable) -> Result<Variable> {
    Ok(primitive(kind, &[lhs, rhs], Dictionary::new())?.output())
}

pub fn plus(lhs: &Variable, rhs: &Variable) -> Result<Variable> {
    binary(PrimitiveKind::Plus, lhs, rhs)
}

pub fn minus(lhs: &Variable, rhs: &Variable) -> Result<Variable> {
    binary(PrimitiveKind::Minus, lhs, rhs)
}

pub fn element_times(lhs: &Variable, rhs: &Variable) -> Result<Variable> {
    binary(PrimitiveKind::ElementTimes, lhs, rhs)
}

/// Matrix product `lhs x rhs` of two rank-2 operands.
pub fn times(lhs: &Variable, rhs: &Variable) -> Result<Variable> {
    binary(PrimitiveKind::Times, lhs, rhs)
}

pub fn negate(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::Negate, x)
}

pub fn relu(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::Relu, x)
}

pub fn sigmoid(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::Sigmoid, x)
}

pub fn tanh(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::Tanh, x)
}

pub fn exp(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::Exp, x)
}

pub fn log(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::Log, x)
}

pub fn reduce_sum(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::ReduceSum, x)
}

pub fn identity(x: &Variable) -> Result<Variable> {
    unary(PrimitiveKind::Identity, x)
}

/// Zeroes each element with probability `rate` and rescales the survivors.
///
/// The mask generator is seeded with `seed`; its offset advances on every forward and is
/// part of the operation's persistent state.
pub fn dropout(x: &Variable, rate: f64, seed: u64) -> Result<Variable> {
    if !(0.0..1.0).contains(&rate) {
        return Err(StructuralError::InvalidAttribute {
            operation: "Dropout".to_string(),
            detail: format!("rate {rate} is outside [0, 1)"),
        }
        .into());
    }
    let mut attrs = Dictionary::new();
    attrs.insert(attributes::DROPOUT_RATE.to_string(), json!(rate));
    attrs.insert(attributes::RNG_SEED.to_string(), json!(seed));
    attrs.insert(attributes::RNG_OFFSET.to_string(), json!(0u64));
    Ok(primitive(PrimitiveKind::Dropout, &[x], attrs)?.output())
}

/// Groups several variables under one root operation.
pub fn combine(outputs: &[Variable]) -> Result<Operation> {
    let operands: Vec<&Variable> = outputs.iter().collect();
    primitive(PrimitiveKind::Combine, &operands, Dictionary::new())
}

/// Wraps the graph rooted at `body` as a single reusable operation.
///
/// Every placeholder of the body must appear in `bindings`, paired with the argument that
/// feeds it. The block's inputs are the body's leaves in first-seen order, with each
/// placeholder replaced by its argument, so body parameters remain visible to callers.
pub fn as_block(
    body: &Operation,
    bindings: &[(Variable, Variable)],
    op_name: impl Into<String>,
) -> Result<Operation> {
    let arena = body.arena();
    for (placeholder, argument) in bindings {
        for var in [placeholder, argument] {
            if !var.same_arena(arena) {
                return Err(StructuralError::ForeignArena {
                    variable: var.label(),
                }
                .into());
            }
        }
    }

    let leaves = leaf_ids(arena, body.id());
    for (placeholder, _) in bindings {
        if placeholder.kind() != VariableKind::Placeholder || !leaves.contains(&placeholder.id()) {
            return Err(UsageError::NotAPlaceholder {
                variable: placeholder.label(),
            }
            .into());
        }
    }

    let mut inputs = Vec::with_capacity(leaves.len());
    let mut block_bindings = Vec::new();
    for leaf in leaves {
        let var = Variable::from_parts(Arc::clone(arena), leaf);
        if var.kind() != VariableKind::Placeholder {
            inputs.push(leaf);
            continue;
        }
        let Some((_, argument)) = bindings.iter().find(|(placeholder, _)| *placeholder == var)
        else {
            return Err(StructuralError::UnresolvedPlaceholder {
                placeholder: var.label(),
            }
            .into());
        };
        block_bindings.push((leaf, inputs.len()));
        inputs.push(argument.id());
    }

    arena.create_operation(NewOperation {
        kind: OpKind::Block(BlockDefinition {
            op_name: op_name.into(),
            body: body.id(),
            bindings: block_bindings,
        }),
        uid: None,
        name: String::new(),
        inputs,
        attributes: Dictionary::new(),
        outputs: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::tensor::{DType, Shape, Tensor};

    #[test]
    fn output_shapes_are_inferred_at_construction() {
        let arena = GraphArena::new();
        let w = arena.parameter("w", Tensor::zeros(Shape::new([2, 3]), DType::F32));
        let x = arena.input("x", Shape::new([3, 1]), DType::F32);
        let y = times(&w, &x).unwrap();
        assert_eq!(y.shape(), Some(Shape::new([2, 1])));
        assert_eq!(y.kind(), VariableKind::Output);
        assert_eq!(y.owner().unwrap().primitive(), Some(PrimitiveKind::Times));
    }

    #[test]
    fn mixing_arenas_is_rejected() {
        let a = GraphArena::new().input("a", Shape::new([1]), DType::F32);
        let b = GraphArena::new().input("b", Shape::new([1]), DType::F32);
        assert!(matches!(
            plus(&a, &b),
            Err(GraphError::Structural(StructuralError::ForeignArena { .. }))
        ));
    }

    #[test]
    fn dropout_rate_is_validated() {
        let arena = GraphArena::new();
        let x = arena.input("x", Shape::new([4]), DType::F32);
        assert!(dropout(&x, 1.0, 7).is_err());
        let y = dropout(&x, 0.5, 7).unwrap();
        let op = y.owner().unwrap();
        assert_eq!(op.attribute(attributes::RNG_SEED), Some(json!(7)));
    }

    #[test]
    fn block_inputs_map_placeholders_to_arguments() {
        let arena = GraphArena::new();
        let p = arena.placeholder("p", None, DType::F32);
        let w = arena.parameter("w", Tensor::ones(Shape::new([2]), DType::F32));
        let body = element_times(&p, &w).unwrap().owner().unwrap();

        let x = arena.input("x", Shape::new([2]), DType::F32);
        let block = as_block(&body, &[(p.clone(), x.clone())], "Scale").unwrap();
        assert_eq!(block.inputs(), vec![x, w]);
        assert_eq!(block.op_name(), "Scale");
        assert_eq!(block.output().shape(), Some(Shape::new([2])));
    }

    #[test]
    fn block_requires_every_placeholder_bound() {
        let arena = GraphArena::new();
        let p = arena.placeholder("p", None, DType::F32);
        let q = arena.placeholder("q", None, DType::F32);
        let body = plus(&p, &q).unwrap().owner().unwrap();
        let x = arena.input("x", Shape::new([2]), DType::F32);
        assert!(as_block(&body, &[(p, x)], "Half").is_err());
    }
}
