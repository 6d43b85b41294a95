//! Producer worker: publish loop with optional throttling and confirms.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{Confirmation, Connection, Connector, Session};
use crate::config::{BenchmarkConfig, TopologyPair};
use crate::error::BrokerResult;
use crate::metrics::Counters;

/// Per-producer totals returned when the worker stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerSummary {
    pub index: usize,
    pub published: u64,
    pub nacked: u64,
    pub errors: u64,
}

/// Result of one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Published,
    Nacked,
    Failed,
    /// Cancelled while awaiting the broker confirmation.
    Abandoned,
}

/// One publishing worker bound to its own connection and pair.
pub struct Producer {
    index: usize,
    pair: TopologyPair,
    conn: Arc<dyn Connection>,
    session: Box<dyn Session>,
    payload: Bytes,
    interval: Option<Duration>,
    confirms: bool,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl Producer {
    /// Dial a dedicated connection and prepare the session.
    ///
    /// With publisher confirms enabled, the session enters confirm mode here,
    /// before anything is published.
    pub async fn start(
        connector: &dyn Connector,
        index: usize,
        config: &BenchmarkConfig,
        payload: Bytes,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) -> BrokerResult<Self> {
        let conn = connector.connect().await?;
        let session = match Self::open_session(conn.as_ref(), config.publisher_confirm).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    debug!(producer = index, error = %close_err, "Producer connection close failed");
                }
                return Err(e);
            }
        };

        Ok(Self {
            index,
            pair: config.pair(index),
            conn,
            session,
            payload,
            interval: config.publish_interval(),
            confirms: config.publisher_confirm,
            counters,
            cancel,
        })
    }

    async fn open_session(conn: &dyn Connection, confirms: bool) -> BrokerResult<Box<dyn Session>> {
        let session = conn.open_session().await?;
        if confirms {
            session.enable_confirms().await?;
        }
        Ok(session)
    }

    /// Publish until cancelled, then release the connection.
    pub async fn run(self) -> ProducerSummary {
        let mut summary = ProducerSummary {
            index: self.index,
            ..Default::default()
        };

        debug!(
            producer = self.index,
            exchange = %self.pair.exchange,
            routing_key = %self.pair.routing_key,
            throttled = self.interval.is_some(),
            confirms = self.confirms,
            "Producer started"
        );

        match self.interval {
            Some(interval) => self.run_throttled(interval, &mut summary).await,
            None => self.run_unthrottled(&mut summary).await,
        }

        if let Err(e) = self.conn.close().await {
            debug!(producer = self.index, error = %e, "Producer connection close failed");
        }
        debug!(
            producer = self.index,
            published = summary.published,
            nacked = summary.nacked,
            errors = summary.errors,
            "Producer stopped"
        );
        summary
    }

    async fn run_throttled(&self, interval: Duration, summary: &mut ProducerSummary) {
        // First publish happens one interval after start.
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.publish_once(summary).await == Outcome::Abandoned {
                return;
            }
        }
    }

    async fn run_unthrottled(&self, summary: &mut ProducerSummary) {
        while !self.cancel.is_cancelled() {
            if self.publish_once(summary).await == Outcome::Abandoned {
                return;
            }
            // Let timers and other workers run on a busy runtime.
            tokio::task::yield_now().await;
        }
    }

    async fn publish_once(&self, summary: &mut ProducerSummary) -> Outcome {
        let outcome = self.publish().await;
        match outcome {
            Outcome::Published => {
                self.counters.record_published();
                summary.published += 1;
            }
            Outcome::Nacked => summary.nacked += 1,
            Outcome::Failed => summary.errors += 1,
            Outcome::Abandoned => {}
        }
        outcome
    }

    async fn publish(&self) -> Outcome {
        let pending = match self
            .session
            .publish(&self.pair.exchange, &self.pair.routing_key, &self.payload)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(producer = self.index, error = %e, "Publish error");
                return Outcome::Failed;
            }
        };

        // Fire-and-forget: a publish without transport error counts.
        if !self.confirms {
            return Outcome::Published;
        }

        let confirmation = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Abandoned,
            confirmation = pending => confirmation,
        };

        match confirmation {
            Ok(Confirmation::Ack) => Outcome::Published,
            Ok(Confirmation::Nack) => {
                warn!(
                    producer = self.index,
                    exchange = %self.pair.exchange,
                    routing_key = %self.pair.routing_key,
                    "Publish nack"
                );
                Outcome::Nacked
            }
            Ok(Confirmation::NotRequested) => {
                warn!(producer = self.index, "Session is not in confirm mode");
                Outcome::Failed
            }
            Err(e) => {
                warn!(producer = self.index, error = %e, "Publish confirm error");
                Outcome::Failed
            }
        }
    }
}
