//! End-to-end benchmark runs against the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use amqp_bench::broker::memory::MemoryBroker;
use amqp_bench::consumer::ConsumerExit;
use amqp_bench::{BenchError, BenchmarkConfig, BenchmarkRunner, ExchangeType, ResultsReport};
use tokio_util::sync::CancellationToken;

fn config() -> BenchmarkConfig {
    BenchmarkConfig {
        url: "memory://".to_string(),
        size: 64,
        connect_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn runner(broker: &MemoryBroker, config: BenchmarkConfig) -> BenchmarkRunner {
    BenchmarkRunner::new(config, Arc::new(broker.clone()))
}

// ============================================================================
// Throughput scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_throttled_two_by_two() {
    let broker = MemoryBroker::new();
    let config = BenchmarkConfig {
        producers: 2,
        consumers: 2,
        rate: 10,
        duration: Duration::from_secs(2),
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    assert!(
        (36..=40).contains(&results.published),
        "published {}",
        results.published
    );
    assert_eq!(results.consumed, results.published);
    assert_eq!(results.producers_started, 2);
    assert_eq!(results.consumers_started, 2);

    let report = ResultsReport::final_lines(&results);
    assert_eq!(
        report,
        format!(
            "Published: {} messages\nConsumed: {} messages",
            results.published, results.consumed
        )
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unthrottled_producer_without_consumers() {
    let broker = MemoryBroker::new();
    let config = BenchmarkConfig {
        producers: 1,
        consumers: 0,
        rate: 0,
        size: 8,
        duration: Duration::from_secs(1),
        ..config()
    };

    let results = tokio::time::timeout(Duration::from_secs(10), runner(&broker, config).run())
        .await
        .expect("run did not finish")
        .unwrap();

    assert!(results.published > 100, "published {}", results.published);
    assert_eq!(results.consumed, 0);
    assert!(results.consumers.is_empty());
    assert!(broker.queue_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_producers_without_peer_use_their_own_pair() {
    let broker = MemoryBroker::new();
    let config = BenchmarkConfig {
        producers: 3,
        consumers: 1,
        rate: 5,
        duration: Duration::from_secs(1),
        drain_timeout: Duration::from_millis(500),
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    let per_producer: Vec<u64> = results.producers.iter().map(|p| p.published).collect();
    assert_eq!(per_producer.len(), 3);
    assert!(per_producer.iter().all(|n| *n >= 4));
    // Only pair 0 has a consumer; no fan-in from the other pairs.
    let producer_0 = results.producers.iter().find(|p| p.index == 0).unwrap();
    assert_eq!(results.consumed, producer_0.published);
}

#[tokio::test(start_paused = true)]
async fn test_counters_never_decrease() {
    let broker = MemoryBroker::new();
    let config = BenchmarkConfig {
        producers: 2,
        consumers: 2,
        rate: 50,
        duration: Duration::from_secs(1),
        ..config()
    };
    let runner = runner(&broker, config);
    let counters = runner.counters();

    let sampler = tokio::spawn(async move {
        let mut last = counters.snapshot();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let now = counters.snapshot();
            assert!(now.published >= last.published);
            assert!(now.consumed >= last.consumed);
            last = now;
        }
    });

    runner.run().await.unwrap();
    sampler.await.unwrap();
}

// ============================================================================
// Confirms and acknowledgements
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_negative_confirm_is_not_counted() {
    let broker = MemoryBroker::new();
    broker.nack_next(1);
    let config = BenchmarkConfig {
        producers: 1,
        consumers: 1,
        rate: 10,
        duration: Duration::from_secs(1),
        publisher_confirm: true,
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    assert_eq!(results.nacked, 1);
    let attempts = results.published + results.nacked;
    assert!((9..=10).contains(&attempts), "attempts {attempts}");
    assert_eq!(results.published, broker.routed_count());
    assert_eq!(results.consumed, results.published);
}

#[tokio::test(start_paused = true)]
async fn test_auto_ack_makes_no_ack_calls() {
    let broker = MemoryBroker::new();
    let config = BenchmarkConfig {
        producers: 1,
        consumers: 1,
        rate: 20,
        duration: Duration::from_secs(1),
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    assert!(results.consumed > 0);
    assert_eq!(results.consumed, results.published);
    assert_eq!(broker.ack_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_ack_failures_still_count() {
    let broker = MemoryBroker::new();
    broker.fail_acks(true);
    let config = BenchmarkConfig {
        producers: 1,
        consumers: 1,
        rate: 20,
        duration: Duration::from_secs(1),
        consumer_confirm: true,
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    assert!(results.consumed > 0);
    assert_eq!(results.ack_failures, results.consumed);
    assert_eq!(broker.ack_count(), 0);
}

// ============================================================================
// Lifecycle and failure handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cleanup_removes_all_pairs() {
    let broker = MemoryBroker::new();
    let config = BenchmarkConfig {
        producers: 2,
        consumers: 3,
        rate: 10,
        duration: Duration::from_millis(500),
        exchange_type: ExchangeType::Topic,
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    let teardown = results.teardown.expect("teardown ran");
    assert_eq!(teardown.deleted_queues, 3);
    assert_eq!(teardown.deleted_exchanges, 3);
    assert!(broker.exchange_names().is_empty());
    assert!(broker.queue_names().is_empty());
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failures_do_not_fail_run() {
    let broker = MemoryBroker::new();
    broker.fail_deletes(true);
    let config = BenchmarkConfig {
        producers: 1,
        consumers: 1,
        rate: 10,
        duration: Duration::from_millis(500),
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    assert_eq!(results.teardown.unwrap().failures, 2);
    assert_eq!(broker.queue_names(), vec!["bench-queue-0"]);
}

#[tokio::test(start_paused = true)]
async fn test_initial_connection_retries_until_available() {
    let broker = MemoryBroker::new();
    broker.refuse_dials(0..5);
    let config = BenchmarkConfig {
        producers: 1,
        consumers: 1,
        rate: 10,
        duration: Duration::from_millis(300),
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();
    assert!(results.published > 0);
}

#[tokio::test(start_paused = true)]
async fn test_bounded_initial_connection_is_fatal() {
    let broker = MemoryBroker::new();
    broker.refuse_dials(0..100);
    let config = BenchmarkConfig {
        connect_attempts: Some(3),
        ..config()
    };

    let err = runner(&broker, config).run().await.unwrap_err();
    assert!(matches!(err, BenchError::Connect { attempts: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_broker_unreachable_ends_run() {
    let broker = MemoryBroker::new();
    broker.refuse_dials(0..100_000);
    let shutdown = CancellationToken::new();
    let runner = runner(&broker, config()).with_shutdown(shutdown.clone());

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
    });
    let err = tokio::time::timeout(Duration::from_secs(600), runner.run())
        .await
        .expect("run kept retrying after shutdown")
        .unwrap_err();
    stopper.await.unwrap();

    assert!(matches!(err, BenchError::Interrupted));
    assert!(broker.dial_count() < 600);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_start_dials_nothing() {
    let broker = MemoryBroker::new();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let err = runner(&broker, config())
        .with_shutdown(shutdown)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Interrupted));
    assert_eq!(broker.dial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_topology_error_aborts_before_workers() {
    let broker = MemoryBroker::new();
    broker.fail_declare("bench-exchange-1");
    let config = BenchmarkConfig {
        producers: 2,
        consumers: 2,
        rate: 10,
        duration: Duration::from_secs(1),
        ..config()
    };

    let err = runner(&broker, config).run().await.unwrap_err();
    assert!(matches!(err, BenchError::Topology { .. }));
    // Only the admin connection was ever dialed.
    assert_eq!(broker.dial_count(), 1);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_consumer_dial_degrades_run() {
    let broker = MemoryBroker::new();
    // Dial 0 is the admin connection, dials 1 and 2 are the consumers.
    broker.refuse_dials([2]);
    let config = BenchmarkConfig {
        producers: 2,
        consumers: 2,
        rate: 10,
        duration: Duration::from_secs(1),
        drain_timeout: Duration::from_millis(500),
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    assert_eq!(results.consumers_started, 1);
    assert_eq!(results.consumers[0].index, 0);
    assert_eq!(results.producers_started, 2);
    assert!(results.published > results.consumed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_producer_dial_degrades_run() {
    let broker = MemoryBroker::new();
    // Dial 0 is admin, dial 1 the consumer, dials 2 and 3 the producers.
    broker.refuse_dials([3]);
    let config = BenchmarkConfig {
        producers: 2,
        consumers: 1,
        rate: 10,
        duration: Duration::from_secs(1),
        ..config()
    };

    let results = runner(&broker, config).run().await.unwrap();

    assert_eq!(results.producers_started, 1);
    assert!(results.published > 0);
}

#[tokio::test]
async fn test_closed_consumer_connection_is_clean_stop() {
    let broker = MemoryBroker::new();
    let config = BenchmarkConfig {
        producers: 1,
        consumers: 2,
        rate: 50,
        ..config()
    };
    let shutdown = CancellationToken::new();
    let runner = runner(&broker, config).with_shutdown(shutdown.clone());

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
    });
    let results = runner.run().await.unwrap();
    stopper.await.unwrap();

    assert_eq!(results.consumers.len(), 2);
    assert!(results
        .consumers
        .iter()
        .all(|c| c.exit == ConsumerExit::StreamClosed));
    assert_eq!(results.ack_failures, 0);
}
