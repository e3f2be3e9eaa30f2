mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use common::{arguments, assert_close, request, values_of, vector, CountingBackend};
use compflow::{
    ops, CompositeGraph, DType, Device, GraphArena, GraphError, Shape, StructuralError, Tensor,
    UsageError,
};

#[test]
fn spliced_graph_matches_direct_construction() -> Result<()> {
    let arena = GraphArena::new();
    let w = arena.parameter("w", Tensor::scalar(3.0));
    let p = arena.placeholder("p", None, DType::F32);
    let scaled = ops::element_times(&p, &w)?;
    assert_eq!(scaled.shape(), None);

    let backend = CountingBackend::new();
    let root = scaled.owner().context("scaled has an owner")?;
    let mut spliced = CompositeGraph::create(root, Arc::clone(&backend))?;
    assert_eq!(spliced.placeholders(), vec![p.clone()]);

    let x = arena.input("x", Shape::new([2]), DType::F32);
    spliced.replace_placeholders(&HashMap::from([(p.clone(), x.clone())]))?;
    assert_eq!(scaled.shape(), Some(Shape::new([2])));
    assert!(spliced.placeholders().is_empty());
    assert_eq!(spliced.arguments(), vec![x.clone()]);

    let direct_out = ops::element_times(&x, &w)?;
    let mut direct = CompositeGraph::create(direct_out.owner().context("owner")?, backend)?;

    let feeds = arguments(&[(&x, vector(&[1.0, 2.0]))]);
    let mut from_splice = request(&[&scaled]);
    spliced.forward(&feeds, &mut from_splice, Device::Cpu, &HashSet::new(), &HashSet::new())?;
    let mut from_direct = request(&[&direct_out]);
    direct.forward(&feeds, &mut from_direct, Device::Cpu, &HashSet::new(), &HashSet::new())?;

    assert_close(&values_of(&from_splice, &scaled)?, &[3.0, 6.0]);
    assert_eq!(
        values_of(&from_splice, &scaled)?,
        values_of(&from_direct, &direct_out)?
    );
    Ok(())
}

#[test]
fn output_replacement_extends_ownership() -> Result<()> {
    let arena = GraphArena::new();
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let y = ops::negate(&p)?;
    let mut graph = CompositeGraph::create(
        y.owner().context("owner")?,
        Arc::new(compflow_backend_ref_cpu::CpuBackend::new()),
    )?;
    assert_eq!(graph.owned_operations().len(), 1);

    let x = arena.input("x", Shape::new([2]), DType::F32);
    let upstream = ops::exp(&x)?;
    graph.replace_placeholders(&HashMap::from([(p, upstream.clone())]))?;

    assert_eq!(graph.owned_operations().len(), 2);
    assert!(graph.owns(&upstream.owner().context("owner")?));
    assert_eq!(graph.inputs(), vec![x.clone()]);

    let mut outputs = request(&[&y]);
    graph.forward(
        &arguments(&[(&x, vector(&[0.0, 0.0]))]),
        &mut outputs,
        Device::Cpu,
        &HashSet::new(),
        &HashSet::new(),
    )?;
    assert_close(&values_of(&outputs, &y)?, &[-1.0, -1.0]);
    Ok(())
}

#[test]
fn unresolved_placeholder_fails_at_compile_time() -> Result<()> {
    let arena = GraphArena::new();
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let y = ops::relu(&p)?;
    let mut graph = CompositeGraph::create(
        y.owner().context("owner")?,
        Arc::new(compflow_backend_ref_cpu::CpuBackend::new()),
    )?;
    let err = graph.compile(Device::Cpu).unwrap_err();
    assert!(
        matches!(
            err,
            GraphError::Structural(StructuralError::UnresolvedPlaceholder { .. })
        ),
        "{err}"
    );
    Ok(())
}

#[test]
fn invalid_replacements_are_rejected() -> Result<()> {
    let arena = GraphArena::new();
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let x = arena.input("x", Shape::new([2]), DType::F32);
    let y = ops::plus(&p, &x)?;
    let mut graph = CompositeGraph::create(
        y.owner().context("owner")?,
        Arc::new(compflow_backend_ref_cpu::CpuBackend::new()),
    )?;

    let other = arena.input("other", Shape::new([2]), DType::F32);
    let err = graph
        .replace_placeholders(&HashMap::from([(x.clone(), other.clone())]))
        .unwrap_err();
    assert!(matches!(err, GraphError::Usage(UsageError::NotAPlaceholder { .. })), "{err}");

    let wide = arena.input("wide", Shape::new([5]), DType::F32);
    let err = graph
        .replace_placeholders(&HashMap::from([(p.clone(), wide)]))
        .unwrap_err();
    assert!(matches!(err, GraphError::Structural(StructuralError::ShapeMismatch { .. })), "{err}");

    let foreign = GraphArena::new().input("f", Shape::new([2]), DType::F32);
    let err = graph
        .replace_placeholders(&HashMap::from([(p, foreign)]))
        .unwrap_err();
    assert!(matches!(err, GraphError::Structural(StructuralError::ForeignArena { .. })), "{err}");
    Ok(())
}
