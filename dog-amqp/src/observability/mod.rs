pub mod metrics;
pub mod tracing;

pub use metrics::{JobMetrics, JobMetricsSnapshot};
pub use self::tracing::{redact_dsn, LogLevel};

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;
