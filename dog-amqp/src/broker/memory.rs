//! In-memory broker for tests and local development.
//!
//! Records every registration, settlement, publish and declaration, and can
//! inject failures and unexpected connection loss. Nacked deliveries are
//! recorded but not redelivered.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    Acker, BrokerChannel, BrokerClient, BrokerConnection, ConsumeOptions, DeliveryStream,
    PublishFlags, QueueInfo,
};
use crate::error::BrokerError;
use crate::options::{ExchangeSpec, QueueSpec};
use crate::types::{ConsumerTag, Delivery, Envelope, FieldArgs};

/// A consumer registration seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub connection_id: u64,
    pub queue: String,
    pub consumer_tag: ConsumerTag,
    pub auto_ack: bool,
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleKind {
    Ack { multiple: bool },
    Nack { multiple: bool, requeue: bool },
}

/// A settlement issued by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub consumer_tag: ConsumerTag,
    pub delivery_tag: u64,
    pub kind: SettleKind,
}

impl Settlement {
    pub fn is_ack(&self) -> bool {
        matches!(self.kind, SettleKind::Ack { .. })
    }

    pub fn is_requeue_nack(&self) -> bool {
        matches!(self.kind, SettleKind::Nack { requeue: true, .. })
    }
}

/// A message published through the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub flags: PublishFlags,
    pub envelope: Envelope,
}

/// A queue binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
    pub exchange: String,
}

/// Declaration step to fail on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclareStep {
    Exchange,
    Queue(String),
    Bind(String),
}

struct ActiveConsumer {
    connection_id: u64,
    queue: String,
    consumer_tag: ConsumerTag,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    dial_attempts: u32,
    failing_dials: u32,
    fail_channel_open: bool,
    fail_consume: bool,
    fail_publish: bool,
    fail_declare: Option<DeclareStep>,
    cancel_sentinel: bool,
    next_connection_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, Arc<MemoryConnection>>,
    current_connection: Option<u64>,
    consumers: Vec<ActiveConsumer>,
    registrations: Vec<Registration>,
    cancellations: Vec<ConsumerTag>,
    settlements: Vec<Settlement>,
    published: Vec<Published>,
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<Binding>,
}

type SharedState = Arc<Mutex<BrokerState>>;

/// In-memory broker; clones share the same state
#[derive(Clone)]
pub struct MemoryBroker {
    state: SharedState,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let state = BrokerState {
            cancel_sentinel: true,
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Refuse the next `count` dial attempts
    pub fn fail_next_dials(&self, count: u32) {
        self.state.lock().failing_dials = count;
    }

    /// Refuse every dial attempt until reset with `fail_next_dials(0)`
    pub fn fail_all_dials(&self) {
        self.state.lock().failing_dials = u32::MAX;
    }

    pub fn fail_channel_open(&self, fail: bool) {
        self.state.lock().fail_channel_open = fail;
    }

    pub fn fail_consume(&self, fail: bool) {
        self.state.lock().fail_consume = fail;
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    pub fn fail_declare(&self, step: Option<DeclareStep>) {
        self.state.lock().fail_declare = step;
    }

    /// Whether cancelling a consumer pushes an empty delivery before ending
    /// its stream, as AMQP client libraries built on closed channels do
    pub fn set_cancel_sentinel(&self, enabled: bool) {
        self.state.lock().cancel_sentinel = enabled;
    }

    /// Close the current connection as if the broker went away
    pub fn drop_connection(&self, reason: &str) -> bool {
        let connection = {
            let mut state = self.state.lock();
            let Some(id) = state.current_connection.take() else {
                return false;
            };
            state.consumers.retain(|c| c.connection_id != id);
            state.connections.get(&id).cloned()
        };

        match connection {
            Some(connection) => {
                *connection.reason.lock() = Some(reason.to_string());
                connection.lost.cancel();
                true
            }
            None => false,
        }
    }

    /// Deliver `payload` to the first consumer on `queue`
    pub fn deliver(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Option<u64> {
        let mut state = self.state.lock();
        let index = state.consumers.iter().position(|c| c.queue == queue)?;
        Self::send_to(&mut state, index, payload.into())
    }

    /// Deliver `payload` to the consumer registered as `tag`
    pub fn deliver_to(&self, tag: &ConsumerTag, payload: impl Into<Vec<u8>>) -> Option<u64> {
        let mut state = self.state.lock();
        let index = state
            .consumers
            .iter()
            .position(|c| &c.consumer_tag == tag)?;
        Self::send_to(&mut state, index, payload.into())
    }

    fn send_to(state: &mut BrokerState, index: usize, payload: Vec<u8>) -> Option<u64> {
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let consumer = &state.consumers[index];
        let connection = state.connections.get(&consumer.connection_id)?.clone();
        let acker = MemoryAcker {
            connection,
            consumer_tag: consumer.consumer_tag.clone(),
            delivery_tag,
        };
        let delivery = Delivery::new(delivery_tag, false, payload, Arc::new(acker));
        consumer.sender.send(delivery).ok()?;
        Some(delivery_tag)
    }

    pub fn dial_attempts(&self) -> u32 {
        self.state.lock().dial_attempts
    }

    /// Number of connections opened so far
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().current_connection.is_some()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.state.lock().registrations.clone()
    }

    pub fn registrations_for(&self, queue: &str) -> Vec<Registration> {
        self.state
            .lock()
            .registrations
            .iter()
            .filter(|r| r.queue == queue)
            .cloned()
            .collect()
    }

    /// Consumers currently registered on `queue`
    pub fn active_consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .count()
    }

    /// Tags of consumers currently registered on `queue`
    pub fn active_tags(&self, queue: &str) -> Vec<ConsumerTag> {
        self.state
            .lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .map(|c| c.consumer_tag.clone())
            .collect()
    }

    pub fn cancellations(&self) -> Vec<ConsumerTag> {
        self.state.lock().cancellations.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state.lock().settlements.clone()
    }

    pub fn settlements_for(&self, delivery_tag: u64) -> Vec<Settlement> {
        self.state
            .lock()
            .settlements
            .iter()
            .filter(|s| s.delivery_tag == delivery_tag)
            .cloned()
            .collect()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn exchanges(&self) -> Vec<ExchangeSpec> {
        self.state.lock().exchanges.clone()
    }

    pub fn queues(&self) -> Vec<QueueSpec> {
        self.state.lock().queues.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().bindings.clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn dial(&self, _dsn: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.state.lock();
        state.dial_attempts += 1;

        if state.failing_dials > 0 {
            if state.failing_dials != u32::MAX {
                state.failing_dials -= 1;
            }
            return Err(BrokerError::transport("connection refused"));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let connection = Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
            lost: CancellationToken::new(),
            reason: Mutex::new(None),
            closed_by_client: AtomicBool::new(false),
        });
        state.connections.insert(id, connection.clone());
        state.current_connection = Some(id);

        Ok(connection)
    }
}

/// Connection handed out by [`MemoryBroker`]
pub struct MemoryConnection {
    id: u64,
    state: SharedState,
    lost: CancellationToken,
    reason: Mutex<Option<String>>,
    closed_by_client: AtomicBool,
}

impl MemoryConnection {
    fn is_open(&self) -> bool {
        !self.lost.is_cancelled() && !self.closed_by_client.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed("connection is not open".into()));
        }
        if self.state.lock().fail_channel_open {
            return Err(BrokerError::transport("channel open refused"));
        }

        let connection = self
            .state
            .lock()
            .connections
            .get(&self.id)
            .cloned()
            .ok_or_else(|| BrokerError::ConnectionClosed("unknown connection".into()))?;

        Ok(Arc::new(MemoryChannel {
            connection,
            closed: AtomicBool::new(false),
        }))
    }

    async fn closed(&self) -> BrokerError {
        self.lost.cancelled().await;
        let reason = self
            .reason
            .lock()
            .clone()
            .unwrap_or_else(|| "connection lost".to_string());
        BrokerError::ConnectionClosed(reason)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed_by_client.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed("already closed".into()));
        }
        let mut state = self.state.lock();
        state.consumers.retain(|c| c.connection_id != self.id);
        if state.current_connection == Some(self.id) {
            state.current_connection = None;
        }
        Ok(())
    }
}

/// Channel handed out by [`MemoryConnection`]
pub struct MemoryChannel {
    connection: Arc<MemoryConnection>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) || !self.connection.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }

    fn state(&self) -> &SharedState {
        &self.connection.state
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &ConsumerTag,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let mut state = self.state().lock();
        if state.fail_consume {
            return Err(BrokerError::transport(format!("no queue '{queue}'")));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.push(ActiveConsumer {
            connection_id: self.connection.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            sender,
        });
        state.registrations.push(Registration {
            connection_id: self.connection.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            auto_ack: options.auto_ack,
        });

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn cancel(&self, consumer_tag: &ConsumerTag, _no_wait: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state().lock();
        state.cancellations.push(consumer_tag.clone());

        let Some(index) = state
            .consumers
            .iter()
            .position(|c| &c.consumer_tag == consumer_tag && c.connection_id == self.connection.id)
        else {
            return Ok(());
        };

        let consumer = state.consumers.remove(index);
        if state.cancel_sentinel {
            state.next_delivery_tag += 1;
            let acker = MemoryAcker {
                connection: self.connection.clone(),
                consumer_tag: consumer.consumer_tag.clone(),
                delivery_tag: state.next_delivery_tag,
            };
            let sentinel = Delivery::new(state.next_delivery_tag, false, Vec::new(), Arc::new(acker));
            let _ = consumer.sender.send(sentinel);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state().lock();
        if state.fail_publish {
            return Err(BrokerError::transport("publish refused"));
        }
        state.published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            flags,
            envelope,
        });
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state().lock();
        if state.fail_declare == Some(DeclareStep::Exchange) {
            return Err(BrokerError::transport("exchange declare refused"));
        }
        state.exchanges.push(spec.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        self.ensure_open()?;
        let mut state = self.state().lock();
        if state.fail_declare == Some(DeclareStep::Queue(spec.name.clone())) {
            return Err(BrokerError::transport("queue declare refused"));
        }
        state.queues.push(spec.clone());
        let consumer_count = state
            .consumers
            .iter()
            .filter(|c| c.queue == spec.name)
            .count() as u32;
        Ok(QueueInfo {
            name: spec.name.clone(),
            message_count: 0,
            consumer_count,
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        _no_wait: bool,
        _arguments: &FieldArgs,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state().lock();
        if state.fail_declare == Some(DeclareStep::Bind(queue.to_string())) {
            return Err(BrokerError::transport("queue bind refused"));
        }
        state.bindings.push(Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            exchange: exchange.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }
}

struct MemoryAcker {
    connection: Arc<MemoryConnection>,
    consumer_tag: ConsumerTag,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, kind: SettleKind) -> Result<(), BrokerError> {
        if !self.connection.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        self.connection.state.lock().settlements.push(Settlement {
            consumer_tag: self.consumer_tag.clone(),
            delivery_tag: self.delivery_tag,
            kind,
        });
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.settle(SettleKind::Ack { multiple })
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.settle(SettleKind::Nack { multiple, requeue })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_and_settle() {
        let broker = MemoryBroker::new();
        let connection = broker.dial("memory://").await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let tag = ConsumerTag::from("jobs-100");

        let mut stream = channel
            .consume("emails", &tag, ConsumeOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.active_consumers("emails"), 1);

        let delivery_tag = broker.deliver("emails", b"hello".to_vec()).unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.delivery_tag, delivery_tag);
        assert_eq!(delivery.payload, b"hello");

        delivery.nack(false, true).await.unwrap();
        delivery.ack(false).await.unwrap();
        let settlements = broker.settlements_for(delivery_tag);
        assert_eq!(settlements.len(), 2);
        assert!(settlements[0].is_requeue_nack());
        assert!(settlements[1].is_ack());
    }

    #[tokio::test]
    async fn test_cancel_flushes_sentinel_then_ends() {
        let broker = MemoryBroker::new();
        let connection = broker.dial("memory://").await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        let tag = ConsumerTag::from("jobs-101");
        let mut stream = channel
            .consume("emails", &tag, ConsumeOptions::default())
            .await
            .unwrap();

        channel.cancel(&tag, false).await.unwrap();

        let sentinel = stream.next().await.unwrap();
        assert!(sentinel.is_empty());
        assert!(stream.next().await.is_none());
        assert_eq!(broker.active_consumers("emails"), 0);
        assert_eq!(broker.cancellations(), vec![tag]);
    }

    #[tokio::test]
    async fn test_drop_connection_resolves_closed() {
        let broker = MemoryBroker::new();
        let connection = broker.dial("memory://").await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        assert!(broker.drop_connection("broker restart"));
        assert_eq!(
            connection.closed().await,
            BrokerError::ConnectionClosed("broker restart".into())
        );
        assert_eq!(
            channel
                .publish("x", "q", PublishFlags::default(), Envelope::new("m"))
                .await,
            Err(BrokerError::ChannelClosed)
        );
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_failing_dials_are_counted() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(2);

        assert!(broker.dial("memory://").await.is_err());
        assert!(broker.dial("memory://").await.is_err());
        assert!(broker.dial("memory://").await.is_ok());
        assert_eq!(broker.dial_attempts(), 3);
        assert_eq!(broker.connection_count(), 1);
    }
}
