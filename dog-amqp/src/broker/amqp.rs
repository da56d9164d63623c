//! RabbitMQ transport built on `lapin`.

use ::lapin::acker::Acker as DeliveryAcker;
use ::lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use ::lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use ::lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use async_trait::async_trait;
use futures::{future, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::broker::{
    Acker, BrokerChannel, BrokerClient, BrokerConnection, ConsumeOptions, DeliveryStream,
    PublishFlags, QueueInfo,
};
use crate::error::BrokerError;
use crate::options::{ExchangeKind, ExchangeSpec, QueueSpec};
use crate::types::{ConsumerTag, Delivery, Envelope, FieldArgs, FieldValue};

const REPLY_SUCCESS: u16 = 200;

fn transport(err: ::lapin::Error) -> BrokerError {
    BrokerError::Transport(err.to_string())
}

/// Dials RabbitMQ with `lapin`
#[derive(Clone, Default)]
pub struct LapinClient {
    properties: ConnectionProperties,
}

impl LapinClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (executor, reactor, client name)
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl BrokerClient for LapinClient {
    async fn dial(&self, dsn: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(dsn, self.properties.clone())
            .await
            .map_err(transport)?;
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

struct LapinConnection {
    connection: Connection,
    lost: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let lost = CancellationToken::new();
        let reason = Arc::new(Mutex::new(None));

        let (on_lost, on_reason) = (lost.clone(), reason.clone());
        connection.on_error(move |err| {
            *on_reason.lock() = Some(err.to_string());
            on_lost.cancel();
        });

        Self {
            connection,
            lost,
            reason,
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(transport)?;
        Ok(Arc::new(LapinChannel { channel }))
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
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(transport)
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &ConsumerTag,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag.as_str(),
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(transport)?;

        let tag = consumer_tag.clone();
        let deliveries = consumer
            .take_while(move |item| {
                if let Err(err) = item {
                    warn!(consumer_tag = %tag, error = %err, "consumer stream failed");
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| {
                future::ready(item.ok().map(|delivery| {
                    Delivery::new(
                        delivery.delivery_tag,
                        delivery.redelivered,
                        delivery.data,
                        Arc::new(LapinAcker(delivery.acker)),
                    )
                }))
            });

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &ConsumerTag, no_wait: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag.as_str(), BasicCancelOptions { nowait: no_wait })
            .await
            .map_err(transport)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.clone()));
        if let Some(priority) = envelope.priority {
            properties = properties.with_priority(priority);
        }
        if !envelope.headers.is_empty() {
            properties = properties.with_headers(field_table(&envelope.headers));
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: flags.mandatory,
                    immediate: flags.immediate,
                },
                &envelope.body,
                properties,
            )
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(&spec.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: spec.no_wait,
                },
                field_table(&spec.arguments),
            )
            .await
            .map_err(transport)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: spec.no_wait,
                },
                field_table(&spec.arguments),
            )
            .await
            .map_err(transport)?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
        arguments: &FieldArgs,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: no_wait },
                field_table(arguments),
            )
            .await
            .map_err(transport)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(transport)
    }
}

struct LapinAcker(DeliveryAcker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(transport)
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(transport)
    }
}

fn exchange_kind(kind: &ExchangeKind) -> ::lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => ::lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => ::lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => ::lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => ::lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(kind) => ::lapin::ExchangeKind::Custom(kind.clone()),
    }
}

fn field_table(arguments: &FieldArgs) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(b) => AMQPValue::Boolean(*b),
        FieldValue::Int(i) => AMQPValue::LongLongInt(*i),
        FieldValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DELAY_HEADER;

    #[test]
    fn test_delay_header_maps_to_long_long_int() {
        let mut headers = FieldArgs::new();
        headers.insert(DELAY_HEADER.to_string(), FieldValue::Int(500));

        let table = field_table(&headers);
        assert_eq!(
            table.inner().get(&ShortString::from(DELAY_HEADER)),
            Some(&AMQPValue::LongLongInt(500))
        );
    }

    #[test]
    fn test_custom_exchange_kind_passes_through() {
        let kind = exchange_kind(&ExchangeKind::Custom("x-delayed-message".into()));
        assert_eq!(kind, ::lapin::ExchangeKind::Custom("x-delayed-message".into()));
    }
}
