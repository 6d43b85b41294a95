//! Error types for the benchmark harness.

use thiserror::Error;

/// Result type alias for broker client operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type alias for controller-level operations.
pub type BenchResult<T> = Result<T, BenchError>;

/// Failure of a single broker protocol operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("declare failed: {0}")]
    Declare(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("connection closed")]
    Closed,
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
                BrokerError::Closed
            }
            other => BrokerError::Channel(other.to_string()),
        }
    }
}

/// Errors that abort a benchmark run.
///
/// Only configuration, initial connectivity (including an operator stop
/// while still connecting) and topology failures reach this type. Worker-local failures are logged and absorbed.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not connect to broker after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("interrupted while waiting for the broker")]
    Interrupted,

    #[error("topology setup failed for {resource}: {source}")]
    Topology {
        resource: String,
        #[source]
        source: BrokerError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
