use std::time::Duration;
use thiserror::Error;

/// Result type for supervisor and job operations
pub type AmqpResult<T> = Result<T, AmqpError>;

/// Errors surfaced to callers of the supervisor and jobs
#[derive(Error, Debug, Clone)]
pub enum AmqpError {
    #[error("failed to connect to the broker after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("failed to open a broker channel: {0}")]
    Channel(#[source] BrokerError),

    #[error("failed to consume messages from queue '{queue}': {source}")]
    ConsumeSetup {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to publish to exchange '{exchange}' with routing key '{routing_key}': {source}")]
    Publish {
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to declare exchange '{exchange}': {source}")]
    DeclareExchange {
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to declare queue '{queue}': {source}")]
    DeclareQueue {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to bind queue '{queue}' to exchange '{exchange}': {source}")]
    BindQueue {
        queue: String,
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("reconnect gave up after {rounds} round(s): {source}")]
    Reconnect {
        rounds: u32,
        #[source]
        source: Box<AmqpError>,
    },

    #[error("not connected to the broker")]
    NotConnected,

    #[error("job '{0}' is publish-only and cannot consume")]
    PublishOnly(String),

    #[error("job '{0}' is already consuming")]
    AlreadyConsuming(String),

    #[error("job '{job}' did not stop within {grace:?}")]
    ShutdownTimeout { job: String, grace: Duration },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AmqpError {
    /// Whether this error came from the transport rather than from local state
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Channel(_)
                | Self::ConsumeSetup { .. }
                | Self::Publish { .. }
                | Self::DeclareExchange { .. }
                | Self::DeclareQueue { .. }
                | Self::BindQueue { .. }
                | Self::Reconnect { .. }
        )
    }
}

/// Errors raised by a broker implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was canceled")]
    Canceled,
}

impl BrokerError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// Outcome of a single handler attempt; never leaves the consume loop
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler reported a failure
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler did not finish before the per-message deadline
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create a handler failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Failed(msg) | Self::Panicked(msg) => msg.clone(),
            Self::Timeout(after) => format!("timed out after {after:?}"),
        }
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_carries_last_cause() {
        let err = AmqpError::Connect {
            attempts: 3,
            source: BrokerError::transport("connection refused"),
        };

        assert!(err.is_transport());
        assert_eq!(
            err.to_string(),
            "failed to connect to the broker after 3 attempt(s): transport error: connection refused"
        );
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("transport error: connection refused"));
    }

    #[test]
    fn test_local_errors_are_not_transport() {
        assert!(!AmqpError::NotConnected.is_transport());
        assert!(!AmqpError::Config("bad".into()).is_transport());
    }

    #[test]
    fn test_handler_error_message() {
        assert_eq!(HandlerError::failed("boom").message(), "boom");
        assert_eq!(
            HandlerError::Timeout(Duration::from_millis(5)).message(),
            "timed out after 5ms"
        );
    }
}
