use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection lifecycle events emitted by the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SupervisorEvent {
    /// A connection and channel were established
    Connected {
        attempts: u32,
        at: DateTime<Utc>,
    },

    /// The broker closed the connection unexpectedly
    ConnectionLost {
        reason: String,
        at: DateTime<Utc>,
    },

    /// A reconnect round succeeded
    Reconnected {
        round: u32,
        at: DateTime<Utc>,
    },

    /// A reconnect round exhausted its dial budget
    ReconnectFailed {
        round: u32,
        error: String,
        at: DateTime<Utc>,
    },

    /// Jobs were drained and re-armed after a reconnect
    JobsRestarted {
        count: usize,
        at: DateTime<Utc>,
    },

    /// The watchdog gave up reconnecting
    WatchdogStopped {
        error: String,
        at: DateTime<Utc>,
    },

    /// The supervisor was closed by its owner
    Closed {
        at: DateTime<Utc>,
    },
}

impl SupervisorEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::Reconnected { .. } => "reconnected",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::JobsRestarted { .. } => "jobs_restarted",
            Self::WatchdogStopped { .. } => "watchdog_stopped",
            Self::Closed { .. } => "closed",
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Connected { at, .. } => at,
            Self::ConnectionLost { at, .. } => at,
            Self::Reconnected { at, .. } => at,
            Self::ReconnectFailed { at, .. } => at,
            Self::JobsRestarted { at, .. } => at,
            Self::WatchdogStopped { at, .. } => at,
            Self::Closed { at } => at,
        }
    }

    /// Whether the event reports a failure the host should act on
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ReconnectFailed { .. } | Self::WatchdogStopped { .. }
        )
    }
}
