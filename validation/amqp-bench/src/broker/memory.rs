//! In-process broker.
//!
//! Implements the broker traits with direct/topic/fanout/headers routing,
//! competing consumers and publisher confirms. Faults can be injected to
//! exercise the degraded paths of the harness: refused dials, failing
//! declares, negative confirms, confirms that never arrive, failing acks
//! and failing deletes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Acknowledger, Confirmation, Connection, Connector, Deliveries, Delivery, PendingConfirm,
    Session,
};
use crate::config::ExchangeType;
use crate::error::{BrokerError, BrokerResult};

/// URL prefix that selects this broker.
pub const SCHEME: &str = "memory://";

#[derive(Debug, Clone, Copy)]
struct Message {
    body_len: usize,
}

type QueueReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>;

struct QueueState {
    tx: mpsc::UnboundedSender<Message>,
    rx: QueueReceiver,
}

struct ExchangeState {
    kind: ExchangeType,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

#[derive(Default)]
struct Faults {
    refused_dials: Mutex<HashSet<usize>>,
    failing_declares: Mutex<HashSet<String>>,
    nacks: AtomicUsize,
    hold_confirms: AtomicBool,
    fail_acks: AtomicBool,
    fail_deletes: AtomicBool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    faults: Faults,
    dials: AtomicUsize,
    open_connections: AtomicUsize,
    delivery_tags: AtomicU64,
    routed: AtomicU64,
    acks: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves the maps consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cheaply cloneable handle to one in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the dials with these zero-based attempt numbers.
    pub fn refuse_dials(&self, attempts: impl IntoIterator<Item = usize>) {
        self.inner
            .faults
            .refused_dials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(attempts);
    }

    /// Fail any declare or bind touching `name`.
    pub fn fail_declare(&self, name: impl Into<String>) {
        self.inner
            .faults
            .failing_declares
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into());
    }

    /// Negatively confirm the next `count` publishes made in confirm mode.
    pub fn nack_next(&self, count: usize) {
        self.inner.faults.nacks.fetch_add(count, Ordering::SeqCst);
    }

    /// Route publishes made in confirm mode but never confirm them.
    pub fn hold_confirms(&self, hold: bool) {
        self.inner.faults.hold_confirms.store(hold, Ordering::SeqCst);
    }

    pub fn fail_acks(&self, fail: bool) {
        self.inner.faults.fail_acks.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.inner.faults.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.state().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Routing keys bound from `exchange` to `queue`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.inner
            .state()
            .exchanges
            .get(exchange)
            .map(|ex| {
                ex.bindings
                    .iter()
                    .filter(|(q, _)| q == queue)
                    .map(|(_, key)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total dial attempts, successful or not.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Messages accepted into at least one queue.
    pub fn routed_count(&self) -> u64 {
        self.inner.routed.load(Ordering::SeqCst)
    }

    /// Successful explicit acknowledgements.
    pub fn ack_count(&self) -> u64 {
        self.inner.acks.load(Ordering::SeqCst)
    }

    fn take_nack(&self) -> bool {
        self.inner
            .faults
            .nacks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn declare_fails(&self, names: &[&str]) -> bool {
        let failing = self
            .inner
            .faults
            .failing_declares
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        names.iter().any(|n| failing.contains(*n))
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn Connection>> {
        let attempt = self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .faults
            .refused_dials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&attempt);
        if refused {
            return Err(BrokerError::Connect(format!(
                "connection refused (dial #{attempt})"
            )));
        }

        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    closed: CancellationToken,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_session(&self) -> BrokerResult<Box<dyn Session>> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            closed: self.closed.clone(),
            confirms: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.broker
                .inner
                .open_connections
                .fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

struct MemorySession {
    broker: MemoryBroker,
    closed: CancellationToken,
    confirms: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.is_cancelled() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.broker.declare_fails(&[name]) {
            return Err(BrokerError::Declare(format!("exchange '{name}' refused")));
        }
        let mut state = self.broker.inner.state();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Declare(format!(
                "PRECONDITION_FAILED - exchange '{name}' exists with type '{}'",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.broker.declare_fails(&[name]) {
            return Err(BrokerError::Declare(format!("queue '{name}' refused")));
        }
        let mut state = self.broker.inner.state();
        state.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueState {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.broker.declare_fails(&[queue, exchange, routing_key]) {
            return Err(BrokerError::Declare(format!(
                "binding '{exchange}' -> '{queue}' refused"
            )));
        }
        let mut state = self.broker.inner.state();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Declare(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Declare(format!("NOT_FOUND - no exchange '{exchange}'")))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        self.confirms.store(true, Ordering::Release);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> BrokerResult<PendingConfirm> {
        self.ensure_open()?;

        let confirm_mode = self.confirms.load(Ordering::Acquire);
        if confirm_mode && self.broker.take_nack() {
            return Ok(futures::future::ready(Ok(Confirmation::Nack)).boxed());
        }

        let targets = {
            let state = self.broker.inner.state();
            let ex = state.exchanges.get(exchange).ok_or_else(|| {
                BrokerError::Publish(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?;
            ex.bindings
                .iter()
                .filter(|(_, key)| routes(ex.kind, key, routing_key))
                .filter_map(|(queue, _)| state.queues.get(queue).map(|q| q.tx.clone()))
                .collect::<Vec<_>>()
        };

        let message = Message {
            body_len: payload.len(),
        };
        let delivered = targets.iter().filter(|tx| tx.send(message).is_ok()).count();
        if delivered > 0 {
            self.broker.inner.routed.fetch_add(1, Ordering::Relaxed);
        }

        if confirm_mode && self.broker.inner.faults.hold_confirms.load(Ordering::SeqCst) {
            return Ok(futures::future::pending::<BrokerResult<Confirmation>>().boxed());
        }

        let confirmation = if confirm_mode {
            Confirmation::Ack
        } else {
            Confirmation::NotRequested
        };
        Ok(futures::future::ready(Ok(confirmation)).boxed())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> BrokerResult<Box<dyn Deliveries>> {
        self.ensure_open()?;
        let rx = self
            .broker
            .inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.rx.clone())
            .ok_or_else(|| BrokerError::Consume(format!("NOT_FOUND - no queue '{queue}'")))?;
        Ok(Box::new(MemoryDeliveries {
            broker: self.broker.clone(),
            closed: self.closed.clone(),
            rx,
            auto_ack,
        }))
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.broker.inner.faults.fail_deletes.load(Ordering::SeqCst) {
            return Err(BrokerError::Delete(format!("queue '{name}' refused")));
        }
        let mut state = self.broker.inner.state();
        state.queues.remove(name);
        for ex in state.exchanges.values_mut() {
            ex.bindings.retain(|(q, _)| q != name);
        }
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.broker.inner.faults.fail_deletes.load(Ordering::SeqCst) {
            return Err(BrokerError::Delete(format!("exchange '{name}' refused")));
        }
        self.broker.inner.state().exchanges.remove(name);
        Ok(())
    }
}

struct MemoryDeliveries {
    broker: MemoryBroker,
    closed: CancellationToken,
    rx: QueueReceiver,
    auto_ack: bool,
}

#[async_trait]
impl Deliveries for MemoryDeliveries {
    async fn next(&mut self) -> Option<BrokerResult<Delivery>> {
        let rx = self.rx.clone();
        let message = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            message = async move { rx.lock().await.recv().await } => message?,
        };

        let tag = self.broker.inner.delivery_tags.fetch_add(1, Ordering::Relaxed) + 1;
        let acker = MemoryAcker {
            broker: self.broker.clone(),
            closed: self.closed.clone(),
            auto_acked: self.auto_ack,
        };
        Some(Ok(Delivery::new(tag, message.body_len, Box::new(acker))))
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    closed: CancellationToken,
    auto_acked: bool,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        if self.auto_acked {
            return Err(BrokerError::Ack(
                "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            ));
        }
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        if self.broker.inner.faults.fail_acks.load(Ordering::SeqCst) {
            return Err(BrokerError::Ack("channel closed by peer".to_string()));
        }
        self.broker.inner.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Whether a binding key routes a message with `routing_key`.
fn routes(kind: ExchangeType, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeType::Direct => binding_key == routing_key,
        ExchangeType::Topic => topic_matches(binding_key, routing_key),
        // No header arguments are ever bound, so every binding matches.
        ExchangeType::Fanout | ExchangeType::Headers => true,
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((k, key_rest))) => word == k && matches(rest, key_rest),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
