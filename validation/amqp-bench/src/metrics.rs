//! Shared throughput counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Published/consumed counts shared by every worker.
///
/// Owned by the controller and handed to workers behind an `Arc`. Counts only
/// ever grow; `Relaxed` ordering is enough since no other memory is published
/// through them.
#[derive(Debug, Default)]
pub struct Counters {
    published: AtomicU64,
    consumed: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            published: self.published(),
            consumed: self.consumed(),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub published: u64,
    pub consumed: u64,
}

/// Per-second throughput between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    pub published_per_sec: f64,
    pub consumed_per_sec: f64,
}

impl CounterSnapshot {
    pub fn rates_since(&self, previous: &CounterSnapshot, elapsed: Duration) -> Rates {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Rates::default();
        }
        Rates {
            published_per_sec: self.published.saturating_sub(previous.published) as f64 / secs,
            consumed_per_sec: self.consumed.saturating_sub(previous.consumed) as f64 / secs,
        }
    }
}
