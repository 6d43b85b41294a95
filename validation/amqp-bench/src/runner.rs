//! Benchmark lifecycle orchestration.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Connector;
use crate::config::{BenchmarkConfig, ExchangeType, TopologyPair};
use crate::connections::{connect_with_retry, WorkerConnections, WorkerRole};
use crate::consumer::{Consumer, ConsumerExit, ConsumerSummary};
use crate::error::{BenchError, BenchResult};
use crate::metrics::Counters;
use crate::producer::{Producer, ProducerSummary};
use crate::reporter;
use crate::topology::{self, TeardownSummary};

const CLEANUP_CONNECT_ATTEMPTS: u32 = 3;
const DRAIN_POLL: Duration = Duration::from_millis(10);
const DRAIN_IDLE: Duration = Duration::from_millis(250);

/// Final benchmark results.
#[derive(Debug, Clone, Serialize)]
pub struct BenchResults {
    pub timestamp: String,
    pub exchange_type: ExchangeType,
    pub rate: u32,
    pub size: usize,
    pub publisher_confirm: bool,
    pub consumer_confirm: bool,
    pub published: u64,
    pub consumed: u64,
    pub nacked: u64,
    pub publish_errors: u64,
    pub ack_failures: u64,
    pub producers_started: usize,
    pub consumers_started: usize,
    /// Time from the first worker starting until producers stopped.
    pub run_secs: f64,
    pub published_per_sec: f64,
    pub consumed_per_sec: f64,
    pub progress_reports: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TeardownSummary>,
    pub producers: Vec<ProducerSummary>,
    pub consumers: Vec<ConsumerSummary>,
}

/// Drives one benchmark run from provisioning to final counts.
pub struct BenchmarkRunner {
    config: Arc<BenchmarkConfig>,
    connector: Arc<dyn Connector>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            counters: Arc::new(Counters::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the run early when `shutdown` fires, exactly as if the duration
    /// had elapsed.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Live counters, readable while the run is in progress.
    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Run the benchmark.
    ///
    /// Fails only on invalid configuration, an exhausted bounded connection
    /// retry, a shutdown while still waiting for the broker, or a topology
    /// declare error. Everything else degrades the run.
    pub async fn run(&self) -> BenchResult<BenchResults> {
        let config = self.config.clone();
        config.validate()?;

        let pairs = self.provision().await?;

        // Fired by the duration timer or an external stop.
        let cancel = self.shutdown.child_token();
        let consumer_stop = CancellationToken::new();
        let reporter_stop = CancellationToken::new();
        let reporter = reporter::spawn(
            self.counters.clone(),
            config.report_interval,
            reporter_stop.clone(),
        );

        let started = Instant::now();
        let mut connections = WorkerConnections::new();
        // Consumers only get a cooperative stop when the run is timed.
        let stop = config.run_duration().map(|_| consumer_stop.clone());
        let consumer_tasks = self.start_consumers(&mut connections, stop).await;
        let producer_tasks = self.start_producers(&cancel);
        let timer = config.run_duration().map(|d| arm_timer(d, cancel.clone()));

        info!(
            producers = config.producers,
            consumers = consumer_tasks.len(),
            rate = config.rate,
            size = config.size,
            duration = ?config.run_duration(),
            publisher_confirm = config.publisher_confirm,
            consumer_confirm = config.consumer_confirm,
            "Benchmark running"
        );

        let producers = join_producers(producer_tasks).await;
        if producers.is_empty() {
            debug!("No producer running, waiting for stop signal");
            cancel.cancelled().await;
        }
        cancel.cancel();
        let run_time = started.elapsed();

        if !consumer_tasks.is_empty() {
            self.drain(config.drain_timeout).await;
        }

        // Consumers have no cooperative stop in an indefinite run: closing
        // their connections ends their delivery streams.
        consumer_stop.cancel();
        let closed = connections.close_all().await;
        debug!(connections = closed, "Closed consumer connections");
        let consumers = join_consumers(consumer_tasks).await;

        let teardown = self.teardown(&pairs).await;

        reporter_stop.cancel();
        let progress_reports = match reporter.await {
            Ok(lines) => lines,
            Err(e) => {
                error!(error = %e, "Progress reporter task failed");
                0
            }
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        Ok(self.results(run_time, producers, consumers, teardown, progress_reports))
    }

    async fn provision(&self) -> BenchResult<Vec<TopologyPair>> {
        let admin = connect_with_retry(
            self.connector.as_ref(),
            self.config.connect_backoff,
            self.config.connect_attempts,
            &self.shutdown,
        )
        .await?;

        let provisioned: BenchResult<Vec<TopologyPair>> = async {
            let session = admin
                .open_session()
                .await
                .map_err(|source| BenchError::Topology {
                    resource: "admin session".to_string(),
                    source,
                })?;
            topology::provision(session.as_ref(), &self.config).await
        }
        .await;

        if let Err(e) = admin.close().await {
            debug!(error = %e, "Admin connection close failed");
        }
        provisioned
    }

    async fn start_consumers(
        &self,
        connections: &mut WorkerConnections,
        stop: Option<CancellationToken>,
    ) -> Vec<JoinHandle<ConsumerSummary>> {
        let mut tasks = Vec::with_capacity(self.config.consumers);

        for index in 0..self.config.consumers {
            match Consumer::start(
                self.connector.as_ref(),
                index,
                &self.config,
                self.counters.clone(),
                stop.clone(),
            )
            .await
            {
                Ok(consumer) => {
                    connections.register(WorkerRole::Consumer, index, consumer.connection());
                    tasks.push(tokio::spawn(consumer.run()));
                }
                Err(e) => warn!(consumer = index, error = %e, "Consumer setup failed, skipping"),
            }
        }

        tasks
    }

    fn start_producers(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<Option<ProducerSummary>>> {
        let payload = self.config.payload();

        (0..self.config.producers)
            .map(|index| {
                let connector = self.connector.clone();
                let config = self.config.clone();
                let payload = payload.clone();
                let counters = self.counters.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    match Producer::start(
                        connector.as_ref(),
                        index,
                        &config,
                        payload,
                        counters,
                        cancel,
                    )
                    .await
                    {
                        Ok(producer) => Some(producer.run().await),
                        Err(e) => {
                            warn!(producer = index, error = %e, "Producer setup failed, skipping");
                            None
                        }
                    }
                })
            })
            .collect()
    }

    /// Give consumers time to catch up with what was published.
    async fn drain(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }

        let deadline = Instant::now() + timeout;
        let mut last_consumed = self.counters.consumed();
        let mut last_progress = Instant::now();

        loop {
            let snapshot = self.counters.snapshot();
            if snapshot.consumed >= snapshot.published {
                debug!(consumed = snapshot.consumed, "Consumers drained");
                return;
            }

            let now = Instant::now();
            if snapshot.consumed != last_consumed {
                last_consumed = snapshot.consumed;
                last_progress = now;
            } else if now.duration_since(last_progress) >= DRAIN_IDLE {
                debug!(
                    outstanding = snapshot.published - snapshot.consumed,
                    "Consumers idle, ending drain"
                );
                return;
            }
            if now >= deadline {
                warn!(
                    outstanding = snapshot.published - snapshot.consumed,
                    "Drain timeout reached"
                );
                return;
            }

            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Best-effort deletion on a fresh admin connection.
    ///
    /// Runs after the shutdown token has usually fired, so the dial is bounded
    /// by its attempt count only.
    async fn teardown(&self, pairs: &[TopologyPair]) -> Option<TeardownSummary> {
        let admin = match connect_with_retry(
            self.connector.as_ref(),
            self.config.connect_backoff,
            Some(CLEANUP_CONNECT_ATTEMPTS),
            &CancellationToken::new(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Cleanup connection failed, topology left in place");
                return None;
            }
        };

        let summary = match admin.open_session().await {
            Ok(session) => Some(topology::teardown(session.as_ref(), pairs).await),
            Err(e) => {
                error!(error = %e, "Cleanup session failed, topology left in place");
                None
            }
        };

        if let Err(e) = admin.close().await {
            debug!(error = %e, "Cleanup connection close failed");
        }
        summary
    }

    fn results(
        &self,
        run_time: Duration,
        producers: Vec<ProducerSummary>,
        consumers: Vec<ConsumerSummary>,
        teardown: Option<TeardownSummary>,
        progress_reports: u64,
    ) -> BenchResults {
        let snapshot = self.counters.snapshot();
        let run_secs = run_time.as_secs_f64();
        let per_sec = |count: u64| {
            if run_secs > 0.0 {
                count as f64 / run_secs
            } else {
                0.0
            }
        };

        BenchResults {
            timestamp: chrono::Utc::now().to_rfc3339(),
            exchange_type: self.config.exchange_type,
            rate: self.config.rate,
            size: self.config.size,
            publisher_confirm: self.config.publisher_confirm,
            consumer_confirm: self.config.consumer_confirm,
            published: snapshot.published,
            consumed: snapshot.consumed,
            nacked: producers.iter().map(|p| p.nacked).sum(),
            publish_errors: producers.iter().map(|p| p.errors).sum(),
            ack_failures: consumers.iter().map(|c| c.ack_failures).sum(),
            producers_started: producers.len(),
            consumers_started: consumers.len(),
            run_secs,
            published_per_sec: per_sec(snapshot.published),
            consumed_per_sec: per_sec(snapshot.consumed),
            progress_reports,
            teardown,
            producers,
            consumers,
        }
    }
}

fn arm_timer(duration: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {
                info!(?duration, "Run duration elapsed");
                cancel.cancel();
            }
        }
    })
}

async fn join_producers(
    tasks: Vec<JoinHandle<Option<ProducerSummary>>>,
) -> Vec<ProducerSummary> {
    let mut summaries = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(Some(summary)) => summaries.push(summary),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Producer task failed"),
        }
    }
    summaries
}

async fn join_consumers(tasks: Vec<JoinHandle<ConsumerSummary>>) -> Vec<ConsumerSummary> {
    let mut summaries = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(summary) => {
                if summary.exit == ConsumerExit::StreamError {
                    debug!(consumer = summary.index, "Consumer ended on stream error");
                }
                summaries.push(summary);
            }
            Err(e) => error!(error = %e, "Consumer task failed"),
        }
    }
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    fn memory_config() -> BenchmarkConfig {
        BenchmarkConfig {
            url: "memory://".to_string(),
            size: 16,
            connect_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_dialing() {
        let broker = MemoryBroker::new();
        let config = BenchmarkConfig {
            producers: 0,
            consumers: 0,
            ..memory_config()
        };
        let runner = BenchmarkRunner::new(config, Arc::new(broker.clone()));
        assert!(matches!(runner.run().await, Err(BenchError::Config(_))));
        assert_eq!(broker.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_external_shutdown_stops_indefinite_run() {
        let broker = MemoryBroker::new();
        let config = BenchmarkConfig {
            rate: 100,
            ..memory_config()
        };
        let shutdown = CancellationToken::new();
        let runner =
            BenchmarkRunner::new(config, Arc::new(broker.clone())).with_shutdown(shutdown.clone());

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.cancel();
        });
        let results = runner.run().await.unwrap();
        stopper.await.unwrap();

        assert!(results.published > 0);
        assert_eq!(results.consumed, results.published);
        assert_eq!(results.consumers[0].exit, ConsumerExit::StreamClosed);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_consumer_only_run_waits_for_duration() {
        let broker = MemoryBroker::new();
        let config = BenchmarkConfig {
            producers: 0,
            consumers: 1,
            duration: Duration::from_millis(100),
            ..memory_config()
        };
        let runner = BenchmarkRunner::new(config, Arc::new(broker));

        let results = runner.run().await.unwrap();
        assert!(results.run_secs >= 0.1);
        assert_eq!(results.consumers_started, 1);
        assert_eq!(results.consumers[0].exit, ConsumerExit::Cancelled);
    }
}
