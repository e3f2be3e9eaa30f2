#![cfg(feature = "profiler")]

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use common::{arguments, request, vector};
use compflow::{ops, profiling, CompositeGraph, DType, Device, GraphArena, Shape};
use compflow_backend_ref_cpu::CpuBackend;

#[test]
fn cache_events_are_counted() -> Result<()> {
    profiling::reset();
    let arena = GraphArena::new();
    let x = arena.input("x", Shape::new([2]), DType::F32);
    let y = ops::exp(&x)?;
    let mut graph = CompositeGraph::create(y.owner().context("owner")?, Arc::new(CpuBackend::new()))?;
    let feeds = arguments(&[(&x, vector(&[0.0, 1.0]))]);
    // Results stay alive so the second forward has something to erase.
    let mut results = Vec::new();
    for _ in 0..2 {
        let mut outputs = request(&[&y]);
        graph.forward(&feeds, &mut outputs, Device::Cpu, &HashSet::new(), &HashSet::new())?;
        results.push(outputs);
    }

    let report = profiling::take_report().context("profiler recorded events")?;
    assert_eq!(report.cache_count("network_build"), 1);
    assert_eq!(report.cache_count("network_cache_hit"), 1);
    assert_eq!(report.cache_count("dependency_cache_miss"), 1);
    assert_eq!(report.cache_count("dependency_cache_hit"), 1);
    assert_eq!(report.cache_count("storage_erased"), 1);
    assert!(report.compile.iter().any(|row| row.name == "composite.forward"));
    Ok(())
}
