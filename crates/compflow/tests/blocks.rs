mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use common::{arguments, assert_close, request, set_of, values_of, vector};
use compflow::{ops, CompositeGraph, DType, Device, GraphArena, GraphError, Shape, Tensor, UsageError};
use compflow_backend_ref_cpu::CpuBackend;

#[test]
fn block_instantiations_share_parameters() -> Result<()> {
    let arena = GraphArena::new();
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let w = arena.parameter("w", Tensor::scalar(2.0));
    let body = ops::element_times(&p, &w)?
        .owner()
        .context("body has an owner")?;

    let x = arena.input("x", Shape::new([2]), DType::F32);
    let first = ops::as_block(&body, &[(p.clone(), x.clone())], "Scale")?;
    let second = ops::as_block(&body, &[(p.clone(), first.output())], "Scale")?;
    assert!(first.is_block());
    assert_eq!(first.op_name(), "Scale");
    assert_eq!(first.inputs(), vec![x.clone(), w.clone()]);

    let loss = ops::reduce_sum(&second.output())?;
    let mut graph = CompositeGraph::create(
        loss.owner().context("loss has an owner")?,
        Arc::new(CpuBackend::new()),
    )?;
    assert_eq!(graph.parameters(), vec![w.clone()]);

    let mut outputs = request(&[&loss]);
    let state = graph.forward(
        &arguments(&[(&x, vector(&[1.0, 2.0]))]),
        &mut outputs,
        Device::Cpu,
        &set_of(&[&loss]),
        &HashSet::new(),
    )?;
    // (1 + 2) * w * w
    assert_close(&values_of(&outputs, &loss)?, &[12.0]);

    let mut gradients = request(&[&w]);
    graph.backward(
        &state,
        &HashMap::from([(loss.clone(), Tensor::scalar(1.0))]),
        &mut gradients,
    )?;
    // d/dw of 3 * w^2
    assert_close(&values_of(&gradients, &w)?, &[12.0]);
    Ok(())
}

#[test]
fn block_bindings_must_cover_every_placeholder() -> Result<()> {
    let arena = GraphArena::new();
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let q = arena.placeholder("q", Some(Shape::new([2])), DType::F32);
    let body = ops::plus(&p, &q)?.owner().context("owner")?;
    let x = arena.input("x", Shape::new([2]), DType::F32);

    assert!(ops::as_block(&body, &[(p.clone(), x.clone())], "Add").is_err());

    let err = ops::as_block(&body, &[(x.clone(), x.clone())], "Add").unwrap_err();
    assert!(matches!(err, GraphError::Usage(UsageError::NotAPlaceholder { .. })), "{err}");

    let block = ops::as_block(&body, &[(p, x.clone()), (q, x)], "Add")?;
    assert_eq!(block.block_bindings().len(), 2);
    Ok(())
}
