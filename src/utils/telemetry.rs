//! # Evaluation Counters
//!
//! Thread-safe counters for likelihood evaluations. Engines bump them once
//! per node or per evaluation, never per site, so the relaxed atomics stay
//! off the hot path. Several engines may share one set of counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct EvalCounters {
    evaluations: AtomicU64,
    nodes_recomputed: AtomicU64,
    rescaled_vectors: AtomicU64,
    rejections: AtomicU64,
    start_time: Instant,
}

impl EvalCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_nodes_recomputed(&self, n: u64) {
        self.nodes_recomputed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_rescaled(&self, n: u64) {
        if n > 0 {
            self.rescaled_vectors.fetch_add(n, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            nodes_recomputed: self.nodes_recomputed.load(Ordering::Relaxed),
            rescaled_vectors: self.rescaled_vectors.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            elapsed_secs: self.elapsed_secs(),
        }
    }
}

impl Default for EvalCounters {
    fn default() -> Self {
        Self {
            evaluations: AtomicU64::new(0),
            nodes_recomputed: AtomicU64::new(0),
            rescaled_vectors: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

/// Counter values at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    pub evaluations: u64,
    pub nodes_recomputed: u64,
    /// Vectors (or per-node site groups) whose values were divided.
    pub rescaled_vectors: u64,
    pub rejections: u64,
    pub elapsed_secs: f64,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} evaluations, {} nodes recomputed, {} rescaled, {} rejected in {}",
            self.evaluations,
            self.nodes_recomputed,
            self.rescaled_vectors,
            self.rejections,
            format_duration(self.elapsed_secs)
        )
    }
}

pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.2}s", secs)
    } else if secs < 3600.0 {
        format!("{}m{:02}s", (secs / 60.0) as u64, (secs % 60.0) as u64)
    } else {
        format!("{}h{:02}m", (secs / 3600.0) as u64, ((secs % 3600.0) / 60.0) as u64)
    }
}
