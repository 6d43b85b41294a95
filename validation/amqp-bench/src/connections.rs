//! Broker connection setup and per-worker connection ownership.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Connection, Connector};
use crate::error::{BenchError, BenchResult};

/// Dial until the broker accepts, sleeping `backoff` between attempts.
///
/// With `max_attempts == None` this only gives up when `cancel` fires, which
/// yields `BenchError::Interrupted`.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    backoff: Duration,
    max_attempts: Option<u32>,
    cancel: &CancellationToken,
) -> BenchResult<Arc<dyn Connection>> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BenchError::Interrupted),
            dialed = connector.connect() => dialed,
        };
        match dialed {
            Ok(conn) => {
                if attempt > 1 {
                    info!(attempts = attempt, "Connected to broker");
                }
                return Ok(conn);
            }
            Err(e) => {
                if max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(BenchError::Connect {
                        attempts: attempt,
                        source: e,
                    });
                }
                warn!(attempt, error = %e, "Waiting for broker");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BenchError::Interrupted),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// Which side of the workload a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerRole {
    Producer,
    Consumer,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Producer => f.write_str("producer"),
            WorkerRole::Consumer => f.write_str("consumer"),
        }
    }
}

/// Connections owned by individual workers, keyed by role and worker index.
///
/// Every worker gets its own connection. The pool only keeps the handles the
/// controller must be able to tear down; `close_all` releases each of them
/// exactly once.
#[derive(Default)]
pub struct WorkerConnections {
    handles: BTreeMap<(WorkerRole, usize), Arc<dyn Connection>>,
}

impl WorkerConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, role: WorkerRole, index: usize, conn: Arc<dyn Connection>) {
        if let Some(previous) = self.handles.insert((role, index), conn) {
            debug!(%role, index, closed = previous.is_closed(), "Replaced worker connection");
        }
    }

    /// Close and drop every registered connection. Close failures are logged.
    pub async fn close_all(&mut self) -> usize {
        let handles = std::mem::take(&mut self.handles);
        let count = handles.len();
        for ((role, index), conn) in handles {
            if let Err(e) = conn.close().await {
                warn!(%role, index, error = %e, "Failed to close worker connection");
            }
        }
        count
    }
}
