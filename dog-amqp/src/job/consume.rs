use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::{BrokerChannel, DeliveryStream};
use crate::error::HandlerError;
use crate::job::JobHandler;
use crate::observability::JobMetrics;
use crate::types::{ConsumerTag, Delivery, HandlerCtx, JobState};

/// The processing loop of one consumer registration.
///
/// `Running` processes deliveries until the shutdown token fires, then the
/// loop cancels its registration and moves to `ShuttingDown`, where it keeps
/// draining until the broker's empty drain sentinel arrives or the stream
/// ends.
///
/// The delivery stream is owned by [`ConsumeLoop::run`], not the struct, so
/// the loop stays `Sync` while its methods are awaited.
pub(crate) struct ConsumeLoop {
    pub channel: Arc<dyn BrokerChannel>,
    pub consumer_tag: ConsumerTag,
    pub handler: Arc<dyn JobHandler>,
    pub exchange: String,
    pub queue: String,
    pub auto_ack: bool,
    pub max_attempts: u32,
    pub handler_timeout: Duration,
    pub shutdown: CancellationToken,
    pub state: Arc<watch::Sender<JobState>>,
    pub metrics: Arc<JobMetrics>,
}

impl ConsumeLoop {
    pub(crate) async fn run(self, mut deliveries: DeliveryStream) {
        let mut state = JobState::Running;

        loop {
            let next = if state == JobState::Running {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        state = self.begin_shutdown().await;
                        if state == JobState::Stopped {
                            break;
                        }
                        continue;
                    }
                    delivery = deliveries.next() => delivery,
                }
            } else {
                deliveries.next().await
            };

            let Some(delivery) = next else {
                if state == JobState::Running {
                    warn!("delivery stream ended while running");
                } else {
                    debug!("delivery stream ended");
                }
                break;
            };

            if delivery.is_empty() {
                if state == JobState::ShuttingDown {
                    debug!("drain sentinel received");
                    break;
                }
                self.metrics.record_ignored_empty();
                if !self.auto_ack {
                    self.ack(&delivery).await;
                }
                continue;
            }

            self.process(&delivery).await;
        }

        self.state.send_replace(JobState::Stopped);
        debug!("consume loop stopped");
    }

    async fn begin_shutdown(&self) -> JobState {
        self.state.send_replace(JobState::ShuttingDown);
        match self.channel.cancel(&self.consumer_tag, false).await {
            Ok(()) => {
                debug!("consumer cancelled, draining");
                JobState::ShuttingDown
            }
            Err(err) => {
                // no drain sentinel will follow a failed cancel
                warn!(error = %err, "failed to cancel consumer");
                JobState::Stopped
            }
        }
    }

    async fn process(&self, delivery: &Delivery) {
        self.metrics.record_delivery();

        if self.auto_ack {
            match self.invoke(delivery, 1).await {
                Ok(()) => debug!(delivery_tag = delivery.delivery_tag, "handler succeeded"),
                Err(err) => error!(
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "handler failed"
                ),
            }
            return;
        }

        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.invoke(delivery, attempt).await {
                Ok(()) => {
                    debug!(delivery_tag = delivery.delivery_tag, attempt, "handler succeeded");
                    self.ack(delivery).await;
                    return;
                }
                Err(err) if attempt < attempts => {
                    error!(
                        delivery_tag = delivery.delivery_tag,
                        attempt,
                        error = %err,
                        "handler failed, requeueing"
                    );
                    self.nack(delivery).await;
                }
                Err(err) => {
                    error!(
                        delivery_tag = delivery.delivery_tag,
                        attempts,
                        error = %err,
                        "handler failed on every attempt, dropping message"
                    );
                    self.metrics.record_dropped();
                    self.ack(delivery).await;
                }
            }
        }
    }

    async fn invoke(&self, delivery: &Delivery, attempt: u32) -> Result<(), HandlerError> {
        self.metrics.record_invocation();

        let cancel = CancellationToken::new();
        let ctx = HandlerCtx::new(
            &self.exchange,
            &self.queue,
            attempt,
            delivery.redelivered,
            self.handler_timeout,
            cancel.clone(),
        );
        let attempt_fut = AssertUnwindSafe(self.handler.handle(ctx, delivery.payload.clone()))
            .catch_unwind();
        let outcome = tokio::time::timeout(self.handler_timeout, attempt_fut).await;
        cancel.cancel();

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic))),
            Err(_) => Err(HandlerError::Timeout(self.handler_timeout)),
        };
        if result.is_err() {
            self.metrics.record_failure();
        }
        result
    }

    async fn ack(&self, delivery: &Delivery) {
        match delivery.ack(false).await {
            Ok(()) => self.metrics.record_ack(),
            Err(err) => error!(
                delivery_tag = delivery.delivery_tag,
                error = %err,
                "failed to ack delivery"
            ),
        }
    }

    async fn nack(&self, delivery: &Delivery) {
        match delivery.nack(false, true).await {
            Ok(()) => self.metrics.record_nack(),
            Err(err) => error!(
                delivery_tag = delivery.delivery_tag,
                error = %err,
                "failed to nack delivery"
            ),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, ConsumeOptions, PublishFlags, QueueInfo};
    use crate::error::BrokerError;
    use crate::options::{ExchangeSpec, QueueSpec};
    use crate::observability::JobMetricsSnapshot;
    use crate::types::{Envelope, FieldArgs};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tracing_test::traced_test;

    type Log = Arc<Mutex<Vec<String>>>;

    struct LogAcker {
        tag: u64,
        log: Log,
    }

    #[async_trait]
    impl Acker for LogAcker {
        async fn ack(&self, _multiple: bool) -> Result<(), BrokerError> {
            self.log.lock().push(format!("ack:{}", self.tag));
            Ok(())
        }

        async fn nack(&self, _multiple: bool, requeue: bool) -> Result<(), BrokerError> {
            assert!(requeue);
            self.log.lock().push(format!("nack:{}", self.tag));
            Ok(())
        }
    }

    /// Channel that answers a cancel with an empty drain sentinel
    struct SentinelChannel {
        sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
        log: Log,
        cancels: AtomicU32,
    }

    #[async_trait]
    impl BrokerChannel for SentinelChannel {
        async fn consume(
            &self,
            _queue: &str,
            _consumer_tag: &ConsumerTag,
            _options: ConsumeOptions,
        ) -> Result<DeliveryStream, BrokerError> {
            Err(BrokerError::ChannelClosed)
        }

        async fn cancel(&self, _tag: &ConsumerTag, _no_wait: bool) -> Result<(), BrokerError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            if let Some(sender) = self.sender.lock().take() {
                let acker = Arc::new(LogAcker {
                    tag: 0,
                    log: self.log.clone(),
                });
                let _ = sender.send(Delivery::new(0, false, Vec::new(), acker));
            }
            Ok(())
        }

        async fn publish(
            &self,
            _exchange: &str,
            _routing_key: &str,
            _flags: PublishFlags,
            _envelope: Envelope,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn declare_exchange(&self, _spec: &ExchangeSpec) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
            Ok(QueueInfo {
                name: spec.name.clone(),
                message_count: 0,
                consumer_count: 0,
            })
        }

        async fn bind_queue(
            &self,
            _queue: &str,
            _routing_key: &str,
            _exchange: &str,
            _no_wait: bool,
            _arguments: &FieldArgs,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    struct Harness {
        consume_loop: ConsumeLoop,
        deliveries: DeliveryStream,
        sender: mpsc::UnboundedSender<Delivery>,
        log: Log,
        shutdown: CancellationToken,
        state: watch::Receiver<JobState>,
        metrics: Arc<JobMetrics>,
        channel: Arc<SentinelChannel>,
    }

    impl Harness {
        fn deliver(&self, tag: u64, payload: &[u8]) {
            let acker = Arc::new(LogAcker {
                tag,
                log: self.log.clone(),
            });
            self.sender
                .send(Delivery::new(tag, false, payload.to_vec(), acker))
                .unwrap();
        }

    }

    fn harness(handler: impl JobHandler, auto_ack: bool, max_attempts: u32) -> Harness {
        let (sender, receiver) = mpsc::unbounded_channel();
        let log: Log = Arc::default();
        let channel = Arc::new(SentinelChannel {
            sender: Mutex::new(Some(sender.clone())),
            log: log.clone(),
            cancels: AtomicU32::new(0),
        });
        let (state_tx, state) = watch::channel(JobState::Running);
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(JobMetrics::new());

        let consume_loop = ConsumeLoop {
            channel: channel.clone(),
            consumer_tag: ConsumerTag::from("billing-123"),
            handler: Arc::new(handler),
            exchange: "billing".to_string(),
            queue: "invoices".to_string(),
            auto_ack,
            max_attempts,
            handler_timeout: Duration::from_millis(50),
            shutdown: shutdown.clone(),
            state: Arc::new(state_tx),
            metrics: metrics.clone(),
        };

        Harness {
            consume_loop,
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
            sender,
            log,
            shutdown,
            state,
            metrics,
            channel,
        }
    }

    struct Outcome {
        settlements: Vec<String>,
        metrics: JobMetricsSnapshot,
        state: JobState,
    }

    /// Runs the loop until every queued delivery is consumed and the stream ends
    async fn run_to_end(harness: Harness) -> Outcome {
        let Harness {
            consume_loop,
            deliveries,
            sender,
            log,
            state,
            metrics,
            channel,
            ..
        } = harness;
        channel.sender.lock().take();
        drop(sender);
        consume_loop.run(deliveries).await;

        let settlements = log.lock().clone();
        let state = *state.borrow();
        Outcome {
            settlements,
            metrics: metrics.snapshot(),
            state,
        }
    }

    fn counting_handler(
        calls: Arc<AtomicU32>,
        succeed_on: Option<u32>,
    ) -> impl JobHandler {
        move |ctx: HandlerCtx, _payload: Vec<u8>| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if succeed_on.is_some() {
                    assert_eq!(ctx.attempt, n);
                }
                match succeed_on {
                    Some(k) if n >= k => Ok(()),
                    _ => Err(HandlerError::failed(format!("attempt {} failed", n))),
                }
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_always_failing_handler_is_retried_then_dropped() {
        let calls = Arc::new(AtomicU32::new(0));
        let harness = harness(counting_handler(calls.clone(), None), false, 3);
        harness.deliver(1, b"{\"id\":1}");

        let outcome = run_to_end(harness).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.settlements, vec!["nack:1", "nack:1", "ack:1"]);
        let snapshot = outcome.metrics;
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.handler_failures, 3);
        assert!(logs_contain("handler failed on every attempt"));
    }

    #[tokio::test]
    async fn test_success_on_later_attempt() {
        for k in 1..=3u32 {
            let calls = Arc::new(AtomicU32::new(0));
            let harness = harness(counting_handler(calls.clone(), Some(k)), false, 3);
            harness.deliver(7, b"payload");

            let outcome = run_to_end(harness).await;

            assert_eq!(calls.load(Ordering::SeqCst), k);
            let settlements = outcome.settlements;
            let nacks = settlements.iter().filter(|s| s.starts_with("nack")).count();
            let acks = settlements.iter().filter(|s| s.starts_with("ack")).count();
            assert_eq!(nacks as u32, k - 1);
            assert_eq!(acks, 1);
            assert_eq!(settlements.last().map(String::as_str), Some("ack:7"));
        }
    }

    #[tokio::test]
    async fn test_single_attempt_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let harness = harness(counting_handler(calls.clone(), None), false, 1);
        harness.deliver(3, b"x");

        let outcome = run_to_end(harness).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.settlements, vec!["ack:3"]);
    }

    #[tokio::test]
    async fn test_auto_ack_never_settles() {
        let calls = Arc::new(AtomicU32::new(0));
        let harness = harness(counting_handler(calls.clone(), None), true, 3);
        harness.deliver(1, b"a");
        harness.deliver(2, b"");
        harness.deliver(3, b"b");

        let outcome = run_to_end(harness).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1 + 1);
        assert!(outcome.settlements.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_and_panic_count_as_failures() {
        let handler = |_ctx: HandlerCtx, payload: Vec<u8>| async move {
            match payload.as_slice() {
                b"slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                b"boom" => panic!("handler exploded"),
                _ => Ok::<(), HandlerError>(()),
            }
        };
        let harness = harness(handler, false, 2);
        harness.deliver(1, b"slow");
        harness.deliver(2, b"boom");
        harness.deliver(3, b"fine");

        let outcome = run_to_end(harness).await;

        assert_eq!(
            outcome.settlements,
            vec!["nack:1", "ack:1", "nack:2", "ack:2", "ack:3"]
        );
        let snapshot = outcome.metrics;
        assert_eq!(snapshot.handler_failures, 4);
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(outcome.state, JobState::Stopped);
    }

    #[tokio::test]
    async fn test_empty_payload_while_running_is_acked_not_processed() {
        let calls = Arc::new(AtomicU32::new(0));
        let harness = harness(counting_handler(calls.clone(), Some(1)), false, 3);
        harness.deliver(1, b"");

        let outcome = run_to_end(harness).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.settlements, vec!["ack:1"]);
        assert_eq!(outcome.metrics.ignored_empty, 1);
    }

    #[tokio::test]
    async fn test_shutdown_sentinel_stops_loop() {
        let calls = Arc::new(AtomicU32::new(0));
        let Harness {
            consume_loop,
            deliveries,
            sender,
            log,
            shutdown,
            mut state,
            channel,
            ..
        } = harness(counting_handler(calls.clone(), Some(1)), false, 3);

        let handle = tokio::spawn(consume_loop.run(deliveries));
        shutdown.cancel();

        state
            .wait_for(|s| *s == JobState::Stopped)
            .await
            .unwrap();
        handle.await.unwrap();

        assert_eq!(channel.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // the sentinel is never settled as data
        assert!(log.lock().is_empty());
        drop(sender);
    }

    #[tokio::test]
    async fn test_in_flight_deliveries_drain_during_shutdown() {
        let calls = Arc::new(AtomicU32::new(0));
        let harness = harness(counting_handler(calls.clone(), Some(1)), false, 3);
        // shutdown fires before the loop polls, the queued delivery still precedes the sentinel
        harness.deliver(4, b"queued");
        harness.shutdown.cancel();

        let Harness {
            consume_loop,
            deliveries,
            log,
            mut state,
            ..
        } = harness;
        consume_loop.run(deliveries).await;

        assert_eq!(*state.borrow_and_update(), JobState::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.lock().clone(), vec!["ack:4"]);
    }

    fn assert_spawnable<F: std::future::Future + Send + 'static>(_: &F) {}

    #[tokio::test]
    async fn test_loop_future_is_send() {
        let harness = harness(counting_handler(Arc::new(AtomicU32::new(0)), Some(1)), false, 3);
        let Harness {
            consume_loop,
            deliveries,
            ..
        } = harness;

        let fut = consume_loop.run(deliveries);
        assert_spawnable(&fut);
    }
}
