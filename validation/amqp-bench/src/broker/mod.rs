//! Broker client abstraction.
//!
//! The harness talks to the broker only through these traits, so the same
//! controller drives a real AMQP 0-9-1 server ([`amqp`]) or the in-process
//! broker ([`memory`]) used for dry runs and tests.

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::ExchangeType;
use crate::error::BrokerResult;

/// Broker answer to a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The session is not in confirm mode.
    NotRequested,
}

/// Resolves once the broker confirms (or rejects) one publish.
pub type PendingConfirm = BoxFuture<'static, BrokerResult<Confirmation>>;

/// Dials new broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn Connection>>;
}

/// One broker connection. Closing it ends every delivery stream opened on it.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_session(&self) -> BrokerResult<Box<dyn Session>>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> BrokerResult<()>;

    fn is_closed(&self) -> bool;
}

/// A channel on a connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Declare a non-durable, non-auto-delete exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> BrokerResult<()>;

    /// Declare a non-durable, auto-delete queue.
    async fn declare_queue(&self, name: &str) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> BrokerResult<()>;

    /// Put the session into publisher-confirm mode. Every later publish
    /// yields a confirmation carrying the broker's ack or nack.
    async fn enable_confirms(&self) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> BrokerResult<PendingConfirm>;

    async fn consume(&self, queue: &str, auto_ack: bool) -> BrokerResult<Box<dyn Deliveries>>;

    async fn delete_queue(&self, name: &str) -> BrokerResult<()>;

    async fn delete_exchange(&self, name: &str) -> BrokerResult<()>;
}

/// Stream of deliveries from one consumer subscription.
#[async_trait]
pub trait Deliveries: Send {
    /// Next delivery; `None` once the subscription or its connection closes.
    async fn next(&mut self) -> Option<BrokerResult<Delivery>>;
}

/// Acknowledges a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub body_len: usize,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body_len: usize, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            body_len,
            acker,
        }
    }

    /// Acknowledge this delivery alone (`multiple = false`).
    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body_len)
            .finish()
    }
}

/// Pick a connector implementation from the URL scheme.
pub fn connector_for_url(url: &str) -> Arc<dyn Connector> {
    if url.starts_with(memory::SCHEME) {
        Arc::new(memory::MemoryBroker::new())
    } else {
        Arc::new(amqp::AmqpConnector::new(url))
    }
}
