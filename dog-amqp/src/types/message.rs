use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::broker::Acker;
use crate::error::BrokerError;

/// Content type used when no `ContentType` option is given
pub const DEFAULT_CONTENT_TYPE: &str = "text/json";

/// Header read by the delayed-message exchange plugin
pub const DELAY_HEADER: &str = "x-delay";

/// Broker argument/header table
pub type FieldArgs = BTreeMap<String, FieldValue>;

/// Value stored in a header or argument table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Outgoing message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// MIME content type
    pub content_type: String,

    /// Message priority, unset means broker default
    pub priority: Option<u8>,

    /// Message headers
    pub headers: FieldArgs,

    /// Opaque payload bytes
    pub body: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with the default content type
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            priority: None,
            headers: FieldArgs::new(),
            body: body.into(),
        }
    }

    /// Set a header, replacing any previous value
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&FieldValue> {
        self.headers.get(key)
    }

    /// Delay in milliseconds requested through the delay header
    pub fn delay_ms(&self) -> Option<i64> {
        match self.headers.get(DELAY_HEADER) {
            Some(FieldValue::Int(ms)) => Some(*ms),
            _ => None,
        }
    }
}

/// One message handed to a consumer, with the handle needed to settle it
#[derive(Clone)]
pub struct Delivery {
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,

    /// Whether the broker delivered this message before
    pub redelivered: bool,

    /// Message payload; empty payloads are never handed to a handler
    pub payload: Vec<u8>,

    acker: Arc<dyn Acker>,
}

impl Delivery {
    /// Create a delivery settled through `acker`
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        payload: Vec<u8>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            payload,
            acker,
        }
    }

    /// Positively acknowledge the delivery
    pub async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.acker.ack(multiple).await
    }

    /// Negatively acknowledge the delivery
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(multiple, requeue).await
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
