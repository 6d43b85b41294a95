//! AMQP 0-9-1 client backed by `lapin`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};
use tracing::debug;

use super::{
    Acknowledger, Confirmation, Connection, Connector, Deliveries, Delivery, PendingConfirm,
    Session,
};
use crate::config::ExchangeType;
use crate::error::{BrokerError, BrokerResult};

const REPLY_SUCCESS: u16 = 200;

/// Dials `lapin` connections on the current tokio runtime.
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn Connection>> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let conn = lapin::Connection::connect(&self.url, properties)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        Ok(Arc::new(AmqpConnection {
            inner: conn,
            closed: AtomicBool::new(false),
        }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_session(&self) -> BrokerResult<Box<dyn Session>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Box::new(AmqpSession { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.inner.close(REPLY_SUCCESS, "benchmark finished").await {
            Ok(()) => Ok(()),
            Err(e) => match BrokerError::from(e) {
                // Already torn down by the broker side.
                BrokerError::Closed => {
                    debug!("Connection already closed");
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || !self.inner.status().connected()
    }
}

struct AmqpSession {
    channel: lapin::Channel,
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> BrokerResult<()> {
        let options = ExchangeDeclareOptions {
            durable: false,
            auto_delete: false,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        let options = QueueDeclareOptions {
            durable: false,
            auto_delete: true,
            ..Default::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn enable_confirms(&self) -> BrokerResult<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> BrokerResult<PendingConfirm> {
        let properties = BasicProperties::default().with_content_type("text/plain".into());
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(LapinConfirmation::Ack(_)) => Ok(Confirmation::Ack),
                Ok(LapinConfirmation::Nack(_)) => Ok(Confirmation::Nack),
                Ok(LapinConfirmation::NotRequested) => Ok(Confirmation::NotRequested),
                Err(e) => Err(BrokerError::Publish(e.to_string())),
            }
        }))
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> BrokerResult<Box<dyn Deliveries>> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..Default::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        Ok(Box::new(AmqpDeliveries { consumer }))
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Delete(e.to_string()))
    }

    async fn delete_exchange(&self, name: &str) -> BrokerResult<()> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| BrokerError::Delete(e.to_string()))
    }
}

struct AmqpDeliveries {
    consumer: lapin::Consumer,
}

#[async_trait]
impl Deliveries for AmqpDeliveries {
    async fn next(&mut self) -> Option<BrokerResult<Delivery>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|d| {
                    Delivery::new(
                        d.delivery_tag,
                        d.data.len(),
                        Box::new(AmqpAcker { acker: d.acker }),
                    )
                })
                .map_err(|e| BrokerError::Consume(e.to_string())),
        )
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
