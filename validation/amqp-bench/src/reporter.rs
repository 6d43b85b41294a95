//! Periodic progress reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{CounterSnapshot, Counters};

/// Log a counter snapshot every `period` until `stop` fires.
///
/// Returns the number of progress lines emitted.
pub fn spawn(counters: Arc<Counters>, period: Duration, stop: CancellationToken) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut previous = CounterSnapshot::default();
        let mut previous_at = Instant::now();
        let mut lines = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = counters.snapshot();
            let rates = now.rates_since(&previous, previous_at.elapsed());
            info!(
                published = now.published,
                consumed = now.consumed,
                published_per_sec = rates.published_per_sec,
                consumed_per_sec = rates.consumed_per_sec,
                "Progress: published={}, consumed={}",
                now.published,
                now.consumed
            );

            previous = now;
            previous_at = Instant::now();
            lines += 1;
        }

        lines
    })
}
