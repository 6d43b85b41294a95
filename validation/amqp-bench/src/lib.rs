//! Load generator for AMQP 0-9-1 message brokers.
//!
//! This crate provides tools to:
//! - Provision one exchange/queue/binding pair per producer-consumer index
//! - Drive independent producers (throttled or unthrottled, optionally
//!   confirmed) and consumers (auto or manual ack), each on its own connection
//! - Stop everything on a duration or an external signal, then clean up
//! - Report throughput while running and final counts at the end

pub mod broker;
pub mod config;
pub mod connections;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod report;
pub mod reporter;
pub mod runner;
pub mod topology;

pub use broker::{connector_for_url, Connector};
pub use config::{BenchmarkConfig, ExchangeType, TopologyPair};
pub use error::{BenchError, BrokerError};
pub use metrics::{CounterSnapshot, Counters};
pub use report::{OutputFormat, ResultsReport};
pub use runner::{BenchResults, BenchmarkRunner};
