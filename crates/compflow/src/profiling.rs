//! Lightweight counters and timing scopes for the compile/evaluate pipeline.
//!
//! Everything here compiles to no-ops unless the `profiler` feature is enabled.

#[cfg(feature = "profiler")]
use std::collections::BTreeMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock, PoisonError};
#[cfg(feature = "profiler")]
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Aggregated statistics for one scope or cache event name.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub name: String,
    pub calls: u64,
    pub total_ns: u128,
}

/// Snapshot of everything recorded since the last reset.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerReport {
    pub compile: Vec<ProfileRow>,
    pub cache: Vec<ProfileRow>,
}

impl ProfilerReport {
    pub fn cache_count(&self, name: &str) -> u64 {
        self.cache
            .iter()
            .find(|row| row.name == name)
            .map_or(0, |row| row.calls)
    }
}

#[cfg(feature = "profiler")]
#[derive(Default)]
struct Stats {
    compile: BTreeMap<&'static str, (u64, u128)>,
    cache: BTreeMap<&'static str, u64>,
}

#[cfg(feature = "profiler")]
fn stats() -> std::sync::MutexGuard<'static, Stats> {
    static INSTANCE: OnceLock<Mutex<Stats>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Mutex::new(Stats::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Times the enclosing block under `name` until dropped.
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    name: &'static str,
    #[cfg(feature = "profiler")]
    start: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "profiler")]
        {
            let elapsed = self.start.elapsed().as_nanos();
            let mut stats = stats();
            let entry = stats.compile.entry(self.name).or_insert((0, 0));
            entry.0 = entry.0.saturating_add(1);
            entry.1 = entry.1.saturating_add(elapsed);
        }
    }
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    #[cfg(feature = "profiler")]
    {
        ScopeGuard {
            name,
            start: Instant::now(),
        }
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
        ScopeGuard {}
    }
}

#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        let mut stats = stats();
        let count = stats.cache.entry(name).or_insert(0);
        *count = count.saturating_add(1);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

/// Drains the recorded statistics. Returns `None` when nothing was recorded.
pub fn take_report() -> Option<ProfilerReport> {
    #[cfg(feature = "profiler")]
    {
        let drained = std::mem::take(&mut *stats());
        if drained.compile.is_empty() && drained.cache.is_empty() {
            return None;
        }
        let compile = drained
            .compile
            .into_iter()
            .map(|(name, (calls, total_ns))| ProfileRow {
                name: name.to_string(),
                calls,
                total_ns,
            })
            .collect();
        let cache = drained
            .cache
            .into_iter()
            .map(|(name, calls)| ProfileRow {
                name: name.to_string(),
                calls,
                total_ns: 0,
            })
            .collect();
        Some(ProfilerReport { compile, cache })
    }
    #[cfg(not(feature = "profiler"))]
    {
        None
    }
}

pub fn take_report_json() -> Option<String> {
    take_report().and_then(|report| serde_json::to_string_pretty(&report).ok())
}

pub fn reset() {
    #[cfg(feature = "profiler")]
    {
        *stats() = Stats::default();
    }
}
