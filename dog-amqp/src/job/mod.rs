pub mod consume;
pub mod registry;

pub use registry::JobRegistry;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::broker::{ConsumeOptions, PublishFlags, SharedChannel};
use crate::error::{AmqpError, AmqpResult, BrokerError, HandlerError};
use crate::observability::JobMetrics;
use crate::options::{build_envelope, PublishOption};
use crate::types::{ConsumerTag, Envelope, HandlerCtx, JobId, JobState};
use consume::ConsumeLoop;

/// Processes the payload of one delivery.
///
/// Implemented for any `Fn(HandlerCtx, Vec<u8>) -> impl Future<Output =
/// Result<(), HandlerError>>`, so plain async closures work as handlers.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: HandlerCtx, payload: Vec<u8>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(HandlerCtx, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerCtx, payload: Vec<u8>) -> Result<(), HandlerError> {
        (self)(ctx, payload).await
    }
}

/// Settings a job inherits from its supervisor
#[derive(Debug, Clone, Copy)]
pub(crate) struct JobSettings {
    pub handler_timeout: Duration,
    pub max_attempts: u32,
    pub shutdown_grace: Duration,
}

struct RunningLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    consumer_tag: ConsumerTag,
}

/// A consumer registration bound to an exchange/queue pair.
///
/// Jobs are created by [`Supervisor::new_job`](crate::Supervisor::new_job)
/// and shared as `Arc<Job>`. A job is never destroyed: it is stopped with
/// [`Job::shutdown`] and re-armed with a fresh consumer registration by
/// [`Job::consume`].
pub struct Job {
    id: JobId,
    exchange: String,
    queue: String,
    auto_ack: bool,
    publish_only: bool,
    handler: Arc<dyn JobHandler>,
    channel: SharedChannel,
    settings: JobSettings,
    running: Mutex<Option<RunningLoop>>,
    state: Arc<watch::Sender<JobState>>,
    metrics: Arc<JobMetrics>,
    span: Span,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handler: Arc<dyn JobHandler>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        auto_ack: bool,
        publish_only: bool,
        channel: SharedChannel,
        settings: JobSettings,
        span: Span,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            id: JobId::new(),
            exchange: exchange.into(),
            queue: queue.into(),
            auto_ack,
            publish_only,
            handler,
            channel,
            settings,
            running: Mutex::new(None),
            state: Arc::new(state),
            metrics: Arc::new(JobMetrics::new()),
            span,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Publish-only jobs never register a consumer
    pub fn publish_only(&self) -> bool {
        self.publish_only
    }

    /// Current loop state
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Wait until the loop reaches `state`
    pub async fn wait_for_state(&self, state: JobState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    /// Tag of the live consumer registration, if any
    pub async fn consumer_tag(&self) -> Option<ConsumerTag> {
        self.running
            .lock()
            .await
            .as_ref()
            .filter(|running| !running.handle.is_finished())
            .map(|running| running.consumer_tag.clone())
    }

    fn label(&self) -> String {
        format!("{}/{}", self.exchange, self.queue)
    }

    /// Register a consumer on the job's queue and spawn the processing loop.
    ///
    /// A zero `handler_timeout` uses the supervisor's configured timeout.
    pub async fn consume(&self, handler_timeout: Duration) -> AmqpResult<()> {
        if self.publish_only {
            return Err(AmqpError::PublishOnly(self.label()));
        }

        let mut running = self.running.lock().await;
        if running
            .as_ref()
            .is_some_and(|current| !current.handle.is_finished())
        {
            return Err(AmqpError::AlreadyConsuming(self.label()));
        }

        let channel = self.channel.current().ok_or(AmqpError::NotConnected)?;
        let consumer_tag = ConsumerTag::generate(&self.exchange);
        let options = ConsumeOptions {
            auto_ack: self.auto_ack,
            ..ConsumeOptions::default()
        };
        let deliveries = channel
            .consume(&self.queue, &consumer_tag, options)
            .await
            .map_err(|source| AmqpError::ConsumeSetup {
                queue: self.queue.clone(),
                source,
            })?;
        self.metrics.record_registration();

        let handler_timeout = if handler_timeout.is_zero() {
            self.settings.handler_timeout
        } else {
            handler_timeout
        };
        let shutdown = CancellationToken::new();
        self.state.send_replace(JobState::Running);

        let consume_loop = ConsumeLoop {
            channel,
            consumer_tag: consumer_tag.clone(),
            handler: self.handler.clone(),
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            auto_ack: self.auto_ack,
            max_attempts: self.settings.max_attempts,
            handler_timeout,
            shutdown: shutdown.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        };

        let span = info_span!(
            parent: &self.span,
            "job",
            job_id = %self.id,
            exchange = %self.exchange,
            queue = %self.queue,
            consumer_tag = %consumer_tag,
        );
        let handle = tokio::spawn(consume_loop.run(deliveries).instrument(span));

        info!(job_id = %self.id, queue = %self.queue, consumer_tag = %consumer_tag, "job consuming");
        *running = Some(RunningLoop {
            shutdown,
            handle,
            consumer_tag,
        });
        Ok(())
    }

    /// Stop the processing loop and wait for it to acknowledge.
    ///
    /// Returns immediately when the job is not running. A loop that does not
    /// stop within the shutdown grace period is aborted. The registration
    /// slot stays locked until the loop has exited, so a concurrent
    /// [`Job::consume`] or `shutdown` waits for the stop to finish.
    pub async fn shutdown(&self) -> AmqpResult<()> {
        let mut running = self.running.lock().await;
        let Some(current) = running.as_mut() else {
            return Ok(());
        };

        let result = if current.handle.is_finished() {
            if let Err(err) = (&mut current.handle).await {
                warn!(job_id = %self.id, error = %err, "job loop exited abnormally");
            }
            Ok(())
        } else {
            current.shutdown.cancel();
            let grace = self.settings.shutdown_grace;
            match tokio::time::timeout(grace, &mut current.handle).await {
                Ok(Ok(())) => {
                    debug!(job_id = %self.id, "job stopped");
                    Ok(())
                }
                Ok(Err(err)) => {
                    warn!(job_id = %self.id, error = %err, "job loop exited abnormally");
                    Ok(())
                }
                Err(_) => {
                    current.handle.abort();
                    warn!(job_id = %self.id, grace = ?grace, "job did not stop in time, aborted");
                    Err(AmqpError::ShutdownTimeout {
                        job: self.label(),
                        grace,
                    })
                }
            }
        };

        *running = None;
        self.state.send_replace(JobState::Stopped);
        result
    }

    /// Publish `payload` to the job's exchange, routed by its queue name.
    ///
    /// Options are applied in order over a `text/json` envelope. Cancelling
    /// `ctx` abandons the publish.
    pub async fn publish<I>(
        &self,
        ctx: &CancellationToken,
        payload: impl Into<Vec<u8>>,
        options: I,
    ) -> AmqpResult<()>
    where
        I: IntoIterator<Item = PublishOption>,
    {
        self.publish_envelope(ctx, build_envelope(payload, options))
            .await
    }

    /// Serialize `value` as JSON and publish it as `application/json`
    #[cfg(feature = "json")]
    pub async fn publish_json<T, I>(
        &self,
        ctx: &CancellationToken,
        value: &T,
        options: I,
    ) -> AmqpResult<()>
    where
        T: serde::Serialize + ?Sized,
        I: IntoIterator<Item = PublishOption>,
    {
        let body = serde_json::to_vec(value)?;
        let options =
            std::iter::once(PublishOption::content_type("application/json")).chain(options);
        self.publish(ctx, body, options).await
    }

    async fn publish_envelope(&self, ctx: &CancellationToken, envelope: Envelope) -> AmqpResult<()> {
        let failed = |source: BrokerError| AmqpError::Publish {
            exchange: self.exchange.clone(),
            routing_key: self.queue.clone(),
            source,
        };

        let channel = self.channel.current().ok_or(AmqpError::NotConnected)?;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(failed(BrokerError::Canceled)),
            result = channel.publish(&self.exchange, &self.queue, PublishFlags::default(), envelope) => {
                result.map_err(failed)
            }
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .field("publish_only", &self.publish_only)
            .field("state", &self.state())
            .finish()
    }
}
