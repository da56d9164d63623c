//! Publish modifiers and provisioning specs.

use serde::{Deserialize, Serialize};

use crate::types::{Envelope, FieldArgs, FieldValue, DELAY_HEADER};

/// Modifier applied to an outgoing envelope.
///
/// Options are applied left to right, so a later option overrides an earlier
/// one touching the same field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOption {
    /// Override the content type
    ContentType(String),

    /// Defer delivery by this many milliseconds (delayed-message exchange)
    Delay(i64),

    /// Message priority
    Priority(u8),
}

impl PublishOption {
    /// Override the content type
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self::ContentType(content_type.into())
    }

    /// Defer delivery by `ms` milliseconds
    pub fn delay(ms: i64) -> Self {
        Self::Delay(ms)
    }

    /// Set the message priority
    pub fn priority(priority: u8) -> Self {
        Self::Priority(priority)
    }

    /// Apply this option to an envelope
    pub fn apply(&self, envelope: &mut Envelope) {
        match self {
            Self::ContentType(content_type) => envelope.content_type = content_type.clone(),
            Self::Delay(ms) => {
                envelope
                    .headers
                    .insert(DELAY_HEADER.to_string(), FieldValue::Int(*ms));
            }
            Self::Priority(priority) => envelope.priority = Some(*priority),
        }
    }
}

/// Build an envelope for `body` with the given options applied in order
pub fn build_envelope<I>(body: impl Into<Vec<u8>>, options: I) -> Envelope
where
    I: IntoIterator<Item = PublishOption>,
{
    let mut envelope = Envelope::new(body);
    for option in options {
        option.apply(&mut envelope);
    }
    envelope
}

/// Exchange routing type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// Plugin-provided type such as `x-delayed-message`
    Custom(String),
}

impl ExchangeKind {
    /// Get the broker-side type name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
            Self::Custom(kind) => kind,
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind.to_lowercase().as_str() {
            "direct" => Self::Direct,
            "fanout" => Self::Fanout,
            "topic" => Self::Topic,
            "headers" => Self::Headers,
            _ => Self::Custom(kind.to_string()),
        }
    }
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: FieldArgs,
}

impl ExchangeSpec {
    /// Create a non-durable exchange spec
    pub fn new(name: impl Into<String>, kind: impl Into<ExchangeKind>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: FieldArgs::new(),
        }
    }

    /// Delayed-message exchange routing like `kind` once the delay elapses
    pub fn delayed(name: impl Into<String>, kind: impl Into<ExchangeKind>) -> Self {
        let routed: ExchangeKind = kind.into();
        Self::new(name, ExchangeKind::Custom("x-delayed-message".to_string()))
            .with_argument("x-delayed-type", routed.as_str())
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Queue declaration; the queue is bound with its own name as routing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: FieldArgs,
}

impl QueueSpec {
    /// Create a non-durable queue spec
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            arguments: FieldArgs::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Enable per-message priorities up to `max`
    pub fn max_priority(self, max: u8) -> Self {
        self.with_argument("x-max-priority", i64::from(max))
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}
