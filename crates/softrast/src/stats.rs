//! Per-context debug counters. Cheap relaxed atomics, readable at any time;
//! tests and tooling use them to observe pipeline behavior.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PipelineCounters {
    pub draws_submitted: AtomicU64,
    pub draws_dropped: AtomicU64,
    pub triangles_binned: AtomicU64,
    pub tiles_rasterized: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub draws_submitted: u64,
    pub draws_dropped: u64,
    pub triangles_binned: u64,
    pub tiles_rasterized: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            draws_submitted: self.draws_submitted.load(Ordering::Relaxed),
            draws_dropped: self.draws_dropped.load(Ordering::Relaxed),
            triangles_binned: self.triangles_binned.load(Ordering::Relaxed),
            tiles_rasterized: self.tiles_rasterized.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}
