//! # dog-amqp: Supervised AMQP Consumers
//!
//! dog-amqp is a reconnecting, job-oriented client for AMQP 0-9-1 brokers
//! such as RabbitMQ. Register named jobs bound to an exchange/queue pair,
//! give each one a handler, and the [`Supervisor`] keeps them consuming
//! across broker disconnects.
//!
//! ## Features
//!
//! - **Bounded retry**: manual-ack jobs retry a failing handler up to
//!   `max_attempts` times, nacking with requeue in between, then drop the
//!   message with a final ack
//! - **Per-message deadlines**: handler timeouts and panics count as failed
//!   attempts and never take the consume loop down
//! - **Graceful shutdown**: cancel the consumer, drain in-flight deliveries,
//!   acknowledge the stop
//! - **Supervised reconnect**: one watchdog per supervisor redials with
//!   backoff and re-arms every job with a fresh consumer registration
//! - **Publish options**: content type, delay (`x-delay`) and priority
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_amqp::prelude::*;
//! use dog_amqp::broker::memory::MemoryBroker;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let supervisor = Supervisor::new(broker.clone(), SupervisorConfig::default());
//! supervisor.connect().await?;
//!
//! let job = supervisor.new_job(
//!     |ctx: HandlerCtx, payload: Vec<u8>| async move {
//!         if payload.is_empty() {
//!             return Err(HandlerError::failed("empty order"));
//!         }
//!         println!("attempt {} on {}", ctx.attempt, ctx.queue);
//!         Ok(())
//!     },
//!     "orders",
//!     "orders.created",
//!     false,
//!     false,
//! );
//! supervisor.start_consuming_jobs().await?;
//!
//! job.publish(&CancellationToken::new(), br#"{"id":1}"#.to_vec(), [PublishOption::priority(3)])
//!     .await?;
//!
//! supervisor.shutdown_jobs().await?;
//! supervisor.close().await;
//! # Ok::<(), AmqpError>(())
//! # }).unwrap();
//! ```

pub mod broker;
pub mod config;
pub mod declare;
pub mod error;
pub mod job;
pub mod observability;
pub mod options;
pub mod supervisor;
pub mod types;

// Core API exports
pub use supervisor::Supervisor;
pub use config::{ReconnectConfig, SupervisorConfig};
pub use error::{AmqpError, AmqpResult, BrokerError, HandlerError};
pub use job::{Job, JobHandler, JobRegistry};
pub use options::{build_envelope, ExchangeKind, ExchangeSpec, PublishOption, QueueSpec};
pub use types::{
    ConsumerTag, Delivery, Envelope, FieldArgs, FieldValue, HandlerCtx, JobId, JobState,
    SupervisorEvent, DEFAULT_CONTENT_TYPE, DELAY_HEADER,
};

// Observability exports
pub use observability::{redact_dsn, JobMetrics, JobMetricsSnapshot, LogLevel};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

// Broker implementations
#[cfg(feature = "amqp")]
pub use broker::amqp::LapinClient;

#[cfg(feature = "memory")]
pub use broker::memory::MemoryBroker;

pub use tokio_util::sync::CancellationToken;

/// Everything needed to run supervised jobs
pub mod prelude {
    pub use crate::{Job, JobHandler, Supervisor};

    pub use crate::{
        AmqpError, AmqpResult, HandlerCtx, HandlerError, JobState, LogLevel, ReconnectConfig,
        SupervisorConfig, SupervisorEvent,
    };

    pub use crate::{ExchangeKind, ExchangeSpec, PublishOption, QueueSpec};

    pub use crate::CancellationToken;

    pub use async_trait::async_trait;
}
