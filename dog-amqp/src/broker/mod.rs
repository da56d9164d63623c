//! Broker capability set used by the supervisor and jobs.
//!
//! The traits mirror the primitives an AMQP 0-9-1 client exposes. The core
//! never talks to a transport directly, so the same supervisor runs against
//! RabbitMQ (through `lapin`) or against the in-memory broker in tests.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::BrokerError;
use crate::options::{ExchangeSpec, QueueSpec};
use crate::types::{ConsumerTag, Delivery, Envelope, FieldArgs};

/// Stream of deliveries for one consumer registration.
///
/// The stream ends once the broker has flushed a cancelled consumer or the
/// channel went away.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Flags for a consumer registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub arguments: FieldArgs,
}

/// Flags for a publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Result of a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Entry point of a broker implementation
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Open a connection to `dsn`
    async fn dial(&self, dsn: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolve once the broker closes the connection unexpectedly
    async fn closed(&self) -> BrokerError;

    /// Close the connection
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Register a consumer on `queue`
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &ConsumerTag,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Cancel a consumer registration
    async fn cancel(&self, consumer_tag: &ConsumerTag, no_wait: bool) -> Result<(), BrokerError>;

    /// Publish an envelope
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        envelope: Envelope,
    ) -> Result<(), BrokerError>;

    /// Declare an exchange
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declare a queue
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError>;

    /// Bind a queue to an exchange
    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
        arguments: &FieldArgs,
    ) -> Result<(), BrokerError>;

    /// Close the channel
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError>;
}

/// Channel handle owned by the supervisor and lent to every job.
///
/// Only the supervisor writes the slot; jobs take a clone of the current
/// channel when they register a consumer or publish.
#[derive(Clone, Default)]
pub struct SharedChannel {
    slot: Arc<RwLock<Option<Arc<dyn BrokerChannel>>>>,
}

impl SharedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current channel, if connected
    pub fn current(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.slot.read().clone()
    }

    pub(crate) fn replace(&self, channel: Arc<dyn BrokerChannel>) -> Option<Arc<dyn BrokerChannel>> {
        self.slot.write().replace(channel)
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.slot.write().take()
    }
}

impl std::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChannel")
            .field("connected", &self.slot.read().is_some())
            .finish()
    }
}
