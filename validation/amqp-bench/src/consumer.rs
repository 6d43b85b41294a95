//! Consumer worker: receive loop with optional manual acknowledgement.
//!
//! A consumer has no cooperative stop in an indefinite run. The controller
//! shuts it down by closing its connection, which ends the delivery stream;
//! the worker treats that end as a normal stop, not a failure.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{Connection, Connector, Deliveries, Session};
use crate::config::{BenchmarkConfig, TopologyPair};
use crate::error::BrokerResult;
use crate::metrics::Counters;

/// Why a consumer's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerExit {
    /// The stop token fired.
    Cancelled,
    /// The delivery stream closed, normally because the connection was torn down.
    StreamClosed,
    /// The stream yielded an error and was abandoned.
    StreamError,
}

/// Per-consumer totals returned when the worker stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSummary {
    pub index: usize,
    pub consumed: u64,
    /// Payload bytes received.
    pub bytes: u64,
    pub ack_failures: u64,
    pub exit: ConsumerExit,
}

/// One consuming worker subscribed to its pair's queue.
pub struct Consumer {
    index: usize,
    pair: TopologyPair,
    conn: Arc<dyn Connection>,
    // Held so the channel stays open for the lifetime of the subscription.
    _session: Box<dyn Session>,
    deliveries: Box<dyn Deliveries>,
    manual_ack: bool,
    counters: Arc<Counters>,
    stop: Option<CancellationToken>,
}

impl Consumer {
    /// Dial a dedicated connection and subscribe to the pair's queue.
    ///
    /// `stop` is `None` when the consumer may only be stopped by closing its
    /// connection.
    pub async fn start(
        connector: &dyn Connector,
        index: usize,
        config: &BenchmarkConfig,
        counters: Arc<Counters>,
        stop: Option<CancellationToken>,
    ) -> BrokerResult<Self> {
        let pair = config.pair(index);
        let manual_ack = config.consumer_confirm;

        let conn = connector.connect().await?;
        let subscribed = async {
            let session = conn.open_session().await?;
            let deliveries = session.consume(&pair.queue, !manual_ack).await?;
            Ok::<_, crate::error::BrokerError>((session, deliveries))
        }
        .await;

        let (session, deliveries) = match subscribed {
            Ok(subscribed) => subscribed,
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    debug!(consumer = index, error = %close_err, "Consumer connection close failed");
                }
                return Err(e);
            }
        };

        Ok(Self {
            index,
            pair,
            conn,
            _session: session,
            deliveries,
            manual_ack,
            counters,
            stop,
        })
    }

    /// Handle the controller keeps to force shutdown.
    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    /// Receive until stopped or the delivery stream ends.
    pub async fn run(mut self) -> ConsumerSummary {
        debug!(
            consumer = self.index,
            queue = %self.pair.queue,
            manual_ack = self.manual_ack,
            "Consumer started"
        );

        let mut consumed = 0u64;
        let mut bytes = 0u64;
        let mut ack_failures = 0u64;

        let exit = loop {
            let next = match &self.stop {
                Some(stop) => tokio::select! {
                    biased;
                    _ = stop.cancelled() => break ConsumerExit::Cancelled,
                    next = self.deliveries.next() => next,
                },
                None => self.deliveries.next().await,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                None => break ConsumerExit::StreamClosed,
                Some(Err(e)) => {
                    if self.conn.is_closed() {
                        debug!(consumer = self.index, error = %e, "Delivery stream ended by shutdown");
                    } else {
                        warn!(consumer = self.index, error = %e, "Delivery stream failed");
                    }
                    break ConsumerExit::StreamError;
                }
            };

            if self.manual_ack {
                if let Err(e) = delivery.ack().await {
                    ack_failures += 1;
                    warn!(
                        consumer = self.index,
                        delivery_tag = delivery.delivery_tag,
                        error = %e,
                        "Ack error"
                    );
                }
            }
            // Counted even when the ack failed: the delivery already happened.
            self.counters.record_consumed();
            consumed += 1;
            bytes += delivery.body_len as u64;
        };

        debug!(
            consumer = self.index,
            consumed,
            bytes,
            ack_failures,
            ?exit,
            "Consumer stopped"
        );
        ConsumerSummary {
            index: self.index,
            consumed,
            bytes,
            ack_failures,
            exit,
        }
    }
}
