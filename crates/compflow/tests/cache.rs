mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use common::{arguments, request, set_of, vector, CountingBackend};
use compflow::{ops, CompositeGraph, CompositeOptions, DType, Device, GraphArena, GraphError, Shape};

#[test]
fn network_is_reused_across_forwards() -> Result<()> {
    let arena = GraphArena::new();
    let x = arena.input_with_gradient("x", Shape::new([3]), DType::F32);
    let y = ops::tanh(&x)?;
    let backend = CountingBackend::new();
    let mut graph = CompositeGraph::create(y.owner().context("owner")?, Arc::clone(&backend))?;
    assert!(!graph.is_compiled());

    graph.compile(Device::Cpu)?;
    assert!(graph.is_compiled());
    let feeds = arguments(&[(&x, vector(&[0.1, 0.2, 0.3]))]);
    for _ in 0..3 {
        graph.forward(&feeds, &mut request(&[&y]), Device::Cpu, &HashSet::new(), &HashSet::new())?;
    }
    assert_eq!(backend.networks_created(), 1);
    assert_eq!(graph.network_builds(), 1);

    // Different gradient exclusions need a differently built network.
    graph.forward(&feeds, &mut request(&[&y]), Device::Cpu, &HashSet::new(), &set_of(&[&x]))?;
    assert_eq!(backend.networks_created(), 2);
    Ok(())
}

#[test]
fn unavailable_device_surfaces_engine_error() -> Result<()> {
    let arena = GraphArena::new();
    let x = arena.input("x", Shape::new([1]), DType::F32);
    let y = ops::exp(&x)?;
    let mut graph = CompositeGraph::create(y.owner().context("owner")?, CountingBackend::new())?;
    let err = graph.compile(Device::Accelerator(0)).unwrap_err();
    assert!(matches!(err, GraphError::Engine { .. }), "{err}");
    assert!(!graph.is_compiled());
    Ok(())
}

#[test]
fn substitution_anywhere_in_the_arena_invalidates() -> Result<()> {
    let arena = GraphArena::new();
    let x = arena.input("x", Shape::new([2]), DType::F32);
    let backend = CountingBackend::new();

    let relu = ops::relu(&x)?;
    let mut first = CompositeGraph::create(relu.owner().context("owner")?, Arc::clone(&backend))?;
    let p = arena.placeholder("p", Some(Shape::new([2])), DType::F32);
    let tanh = ops::tanh(&p)?;
    let mut second = CompositeGraph::create(tanh.owner().context("owner")?, Arc::clone(&backend))?;

    let feeds = arguments(&[(&x, vector(&[-1.0, 1.0]))]);
    first.forward(&feeds, &mut request(&[&relu]), Device::Cpu, &HashSet::new(), &HashSet::new())?;
    assert!(first.is_compiled());

    second.replace_placeholders(&HashMap::from([(p, x.clone())]))?;
    assert!(!first.is_compiled());

    first.forward(&feeds, &mut request(&[&relu]), Device::Cpu, &HashSet::new(), &HashSet::new())?;
    assert_eq!(first.network_builds(), 2);
    second.forward(&feeds, &mut request(&[&tanh]), Device::Cpu, &HashSet::new(), &HashSet::new())?;
    assert_eq!(second.network_builds(), 1);
    Ok(())
}

#[test]
fn eager_allocation_happens_at_compile() -> Result<()> {
    let arena = GraphArena::new();
    let x = arena.input("x", Shape::new([2]), DType::F32);
    let y = ops::sigmoid(&x)?;
    let options = CompositeOptions::default().with_eager_allocation(true);
    let mut graph = CompositeGraph::create_with_options(
        y.owner().context("owner")?,
        CountingBackend::new(),
        options,
    )?;
    assert!(graph.options().eager_allocation());
    graph.compile(Device::Cpu)?;
    graph.forward(
        &arguments(&[(&x, vector(&[0.0, 0.0]))]),
        &mut request(&[&y]),
        Device::Cpu,
        &HashSet::new(),
        &HashSet::new(),
    )?;
    assert_eq!(graph.network_builds(), 1);
    Ok(())
}
