//! Execution counters.
//!
//! A [`RunStats`] is a set of atomic counters shared between the worker
//! pools and the coefficient cache; the drivers snapshot it to JSON at the
//! end of a run.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one pool/graph pairing. Cheap to bump from any thread.
#[derive(Default)]
pub struct RunStats {
    evaluations: AtomicU64,
    evictions: AtomicU64,
    reloads: AtomicU64,
    spills: AtomicU64,
}

/// Point-in-time copy of a [`RunStats`], serialisable for reporting.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Primitive operations dispatched to an algebra helper.
    pub evaluations: u64,
    /// Concrete coefficients pushed out of memory by the byte budget.
    pub evictions: u64,
    /// Evicted coefficients re-materialised on demand.
    pub reloads: u64,
    /// Evictions that had to write the coefficient to the spill store.
    pub spills: u64,
}

impl RunStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_spill(&self) {
        self.spills.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// JSON object form, as the drivers report it.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("stats serialise")
    }
}
