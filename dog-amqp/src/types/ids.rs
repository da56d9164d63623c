use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a registered job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Name under which a consumer registration is known to the broker.
///
/// Generated tags are `<exchange>-<n>` with `n` in `100..=998`. They are not
/// guaranteed to be unique; the broker rejects a duplicate on the same
/// channel and the registration fails like any other setup error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerTag(pub String);

impl ConsumerTag {
    /// Generate a tag for a consumer bound to `exchange`
    pub fn generate(exchange: &str) -> Self {
        let suffix = 100 + rand::thread_rng().gen_range(0..899);
        Self(format!("{exchange}-{suffix}"))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConsumerTag {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_tag_shape() {
        for _ in 0..200 {
            let tag = ConsumerTag::generate("orders");
            let suffix = tag
                .as_str()
                .strip_prefix("orders-")
                .expect("tag keeps exchange prefix");
            let n: u32 = suffix.parse().unwrap();
            assert!((100..=998).contains(&n), "suffix {n} out of range");
        }
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
