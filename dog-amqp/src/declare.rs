use tracing::{debug, info};

use crate::broker::BrokerChannel;
use crate::error::{AmqpError, AmqpResult};
use crate::options::{ExchangeSpec, QueueSpec};
use crate::types::FieldArgs;

/// Declare `exchange`, then declare every queue and bind it to the exchange
/// using the queue name as routing key.
///
/// Stops at the first failing step. Fails with [`AmqpError::Config`] before
/// touching the broker when `queues` is empty.
pub async fn declare(
    channel: &dyn BrokerChannel,
    exchange: &ExchangeSpec,
    queues: &[QueueSpec],
) -> AmqpResult<()> {
    if queues.is_empty() {
        return Err(AmqpError::Config(format!(
            "declare of exchange '{}' needs at least one queue",
            exchange.name
        )));
    }

    channel
        .declare_exchange(exchange)
        .await
        .map_err(|source| AmqpError::DeclareExchange {
            exchange: exchange.name.clone(),
            source,
        })?;
    debug!(exchange = %exchange.name, kind = %exchange.kind, "exchange declared");

    for queue in queues {
        channel
            .declare_queue(queue)
            .await
            .map_err(|source| AmqpError::DeclareQueue {
                queue: queue.name.clone(),
                source,
            })?;

        channel
            .bind_queue(
                &queue.name,
                &queue.name,
                &exchange.name,
                queue.no_wait,
                &FieldArgs::new(),
            )
            .await
            .map_err(|source| AmqpError::BindQueue {
                queue: queue.name.clone(),
                exchange: exchange.name.clone(),
                source,
            })?;
        debug!(queue = %queue.name, exchange = %exchange.name, "queue declared and bound");
    }

    info!(exchange = %exchange.name, queues = queues.len(), "declare complete");
    Ok(())
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::broker::memory::{Binding, DeclareStep, MemoryBroker};
    use crate::broker::{BrokerClient, BrokerChannel};
    use crate::options::ExchangeKind;
    use std::sync::Arc;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.dial("amqp://memory").await.unwrap();
        connection.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_declares_and_binds_each_queue() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        let exchange = ExchangeSpec::delayed("mail", ExchangeKind::Direct).durable(true);
        let queues = [
            QueueSpec::new("mail.send").durable(true),
            QueueSpec::new("mail.bounce").max_priority(5),
        ];

        declare(channel.as_ref(), &exchange, &queues).await.unwrap();

        assert_eq!(broker.exchanges(), vec![exchange]);
        assert_eq!(broker.queues().len(), 2);
        assert_eq!(
            broker.bindings(),
            vec![
                Binding {
                    queue: "mail.send".into(),
                    routing_key: "mail.send".into(),
                    exchange: "mail".into(),
                },
                Binding {
                    queue: "mail.bounce".into(),
                    routing_key: "mail.bounce".into(),
                    exchange: "mail".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_queues_is_a_config_error() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;

        let err = declare(channel.as_ref(), &ExchangeSpec::new("mail", "direct"), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::Config(_)));
        assert!(broker.exchanges().is_empty());
    }

    #[tokio::test]
    async fn test_fails_fast_on_queue_error() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        broker.fail_declare(Some(DeclareStep::Queue("b".into())));
        let queues = [QueueSpec::new("a"), QueueSpec::new("b"), QueueSpec::new("c")];

        let err = declare(channel.as_ref(), &ExchangeSpec::new("x", "fanout"), &queues)
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::DeclareQueue { queue, .. } if queue == "b"));
        assert_eq!(broker.bindings().len(), 1);
        assert!(broker.queues().iter().all(|q| q.name != "c"));
    }

    #[tokio::test]
    async fn test_exchange_failure() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        broker.fail_declare(Some(DeclareStep::Exchange));

        let err = declare(channel.as_ref(), &ExchangeSpec::new("x", "topic"), &[QueueSpec::new("a")])
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::DeclareExchange { exchange, .. } if exchange == "x"));
        assert!(broker.queues().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        broker.fail_declare(Some(DeclareStep::Bind("a".into())));

        let err = declare(channel.as_ref(), &ExchangeSpec::new("x", "topic"), &[QueueSpec::new("a")])
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::BindQueue { queue, exchange, .. } if queue == "a" && exchange == "x"));
    }
}
