//! Exchange/queue/binding provisioning for producer-consumer pairs.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::Session;
use crate::config::{BenchmarkConfig, TopologyPair};
use crate::error::{BenchError, BenchResult};

/// Declare one exchange, queue and binding per pair.
///
/// Declares are idempotent, so re-running against existing names succeeds.
/// The first failure aborts; nothing already declared is rolled back.
pub async fn provision(
    session: &dyn Session,
    config: &BenchmarkConfig,
) -> BenchResult<Vec<TopologyPair>> {
    let pairs = config.pairs();

    for pair in &pairs {
        session
            .declare_exchange(&pair.exchange, config.exchange_type)
            .await
            .map_err(|source| BenchError::Topology {
                resource: format!("exchange {} (type {})", pair.exchange, config.exchange_type),
                source,
            })?;
        session
            .declare_queue(&pair.queue)
            .await
            .map_err(|source| BenchError::Topology {
                resource: format!("queue {}", pair.queue),
                source,
            })?;
        session
            .bind_queue(&pair.queue, &pair.routing_key, &pair.exchange)
            .await
            .map_err(|source| BenchError::Topology {
                resource: format!("binding {} -> {}", pair.exchange, pair.queue),
                source,
            })?;
        debug!(
            exchange = %pair.exchange,
            queue = %pair.queue,
            routing_key = %pair.routing_key,
            "Declared pair"
        );
    }

    info!(
        pairs = pairs.len(),
        exchange_type = %config.exchange_type,
        "Topology provisioned"
    );
    Ok(pairs)
}

/// Outcome of best-effort topology deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownSummary {
    pub deleted_queues: usize,
    pub deleted_exchanges: usize,
    pub failures: usize,
}

/// Delete every pair's queue and exchange. Failures are logged and counted.
pub async fn teardown(session: &dyn Session, pairs: &[TopologyPair]) -> TeardownSummary {
    let mut summary = TeardownSummary::default();

    for pair in pairs {
        match session.delete_queue(&pair.queue).await {
            Ok(()) => summary.deleted_queues += 1,
            Err(e) => {
                summary.failures += 1;
                warn!(queue = %pair.queue, error = %e, "Queue delete failed");
            }
        }
        match session.delete_exchange(&pair.exchange).await {
            Ok(()) => summary.deleted_exchanges += 1,
            Err(e) => {
                summary.failures += 1;
                warn!(exchange = %pair.exchange, error = %e, "Exchange delete failed");
            }
        }
    }

    info!(
        queues = summary.deleted_queues,
        exchanges = summary.deleted_exchanges,
        failures = summary.failures,
        "Topology removed"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Connector;
    use crate::config::ExchangeType;

    fn config(producers: usize, consumers: usize) -> BenchmarkConfig {
        BenchmarkConfig {
            url: "memory://".to_string(),
            producers,
            consumers,
            exchange_type: ExchangeType::Topic,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_provision_declares_max_side_pairs() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let session = conn.open_session().await.unwrap();

        let pairs = provision(session.as_ref(), &config(3, 1)).await.unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(
            broker.exchange_names(),
            vec!["bench-exchange-0", "bench-exchange-1", "bench-exchange-2"]
        );
        assert_eq!(
            broker.queue_names(),
            vec!["bench-queue-0", "bench-queue-1", "bench-queue-2"]
        );
        assert_eq!(
            broker.bindings("bench-exchange-1", "bench-queue-1"),
            vec!["bench-key-1"]
        );
    }

    #[tokio::test]
    async fn test_provision_twice_is_idempotent() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let session = conn.open_session().await.unwrap();

        provision(session.as_ref(), &config(2, 2)).await.unwrap();
        provision(session.as_ref(), &config(2, 2)).await.unwrap();
        assert_eq!(broker.queue_names().len(), 2);
        assert_eq!(broker.bindings("bench-exchange-0", "bench-queue-0").len(), 1);
    }

    #[tokio::test]
    async fn test_provision_stops_at_first_failure() {
        let broker = MemoryBroker::new();
        broker.fail_declare("bench-queue-1");
        let conn = broker.connect().await.unwrap();
        let session = conn.open_session().await.unwrap();

        let err = provision(session.as_ref(), &config(3, 3)).await.unwrap_err();
        match err {
            BenchError::Topology { resource, .. } => assert_eq!(resource, "queue bench-queue-1"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!broker.exchange_names().contains(&"bench-exchange-2".to_string()));
    }

    #[tokio::test]
    async fn test_teardown_is_best_effort() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let session = conn.open_session().await.unwrap();
        let pairs = provision(session.as_ref(), &config(2, 0)).await.unwrap();

        broker.fail_deletes(true);
        let summary = teardown(session.as_ref(), &pairs).await;
        assert_eq!(summary.failures, 4);
        assert_eq!(broker.queue_names().len(), 2);

        broker.fail_deletes(false);
        let summary = teardown(session.as_ref(), &pairs).await;
        assert_eq!(
            summary,
            TeardownSummary {
                deleted_queues: 2,
                deleted_exchanges: 2,
                failures: 0
            }
        );
        assert!(broker.queue_names().is_empty());
        assert!(broker.exchange_names().is_empty());
    }
}
