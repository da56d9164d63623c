use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-attempt context handed to a job handler.
///
/// The token is cancelled once the per-message timeout elapses or the
/// attempt finishes, whichever comes first. Handlers that spawn work of their
/// own should watch it; the handler future itself is dropped at the deadline.
#[derive(Debug, Clone)]
pub struct HandlerCtx {
    /// Exchange of the job running the handler
    pub exchange: String,

    /// Queue the delivery was consumed from
    pub queue: String,

    /// Attempt number, starting at 1
    pub attempt: u32,

    /// Whether the broker flagged the delivery as redelivered
    pub redelivered: bool,

    deadline: Instant,
    cancel: CancellationToken,
}

impl HandlerCtx {
    pub(crate) fn new(
        exchange: &str,
        queue: &str,
        attempt: u32,
        redelivered: bool,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            attempt,
            redelivered,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Instant after which the attempt counts as timed out
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Token cancelled when the attempt is over
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Check whether the attempt has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
