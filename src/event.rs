//! Consumer-implemented metrics sink.
//!
//! Subsystems report standardized counters and timers to an
//! `Arc<dyn MetricsSink>` supplied by the application. Implementations must
//! be cheap and non-blocking; sinks are invoked inline on I/O paths.

use std::{fmt, sync::Arc, time::Duration};

/// Metric name for dial attempts, tagged with `address` and `success`.
pub const DIAL_ATTEMPTS: &str = "dial_attempts";
/// Metric name for pool hits, tagged with `address`.
pub const POOL_HITS: &str = "pool_hits";
/// Metric name for pool misses, tagged with `address`.
pub const POOL_MISSES: &str = "pool_misses";
/// Metric name for connections created by the pool, tagged with `address`.
pub const CONNECTIONS_CREATED: &str = "connections_created";
/// Metric name for expired pool entries, tagged with `address` and `reason`.
pub const CONNECTIONS_EXPIRED: &str = "connections_expired";
/// Metric name for bytes read per connection, tagged with `id` and `protocol`.
pub const CONNECTION_BYTES_READ: &str = "connection_bytes_read";
/// Metric name for bytes written per connection, tagged with `id` and `protocol`.
pub const CONNECTION_BYTES_WRITTEN: &str = "connection_bytes_written";
/// Metric name for the lifetime of a closed connection.
pub const CONNECTION_DURATION: &str = "connection_duration";

/// A single `key=value` metric tag.
pub type Tag = (&'static str, String);

/// A sink for the metrics the fabric emits. All methods have no-op defaults
/// so implementations only override what they record.
pub trait MetricsSink: Send + Sync {
    /// Add one to a named counter.
    fn increment_counter(&self, name: &str, tags: &[Tag]) {
        let _ = (name, tags);
    }

    /// Record the current value of a gauge.
    fn record_gauge(&self, name: &str, value: f64, tags: &[Tag]) {
        let _ = (name, value, tags);
    }

    /// Record an observation in a histogram.
    fn record_histogram(&self, name: &str, value: f64, tags: &[Tag]) {
        let _ = (name, value, tags);
    }

    /// Record an elapsed duration.
    fn record_timer(&self, name: &str, duration: Duration, tags: &[Tag]) {
        let _ = (name, duration, tags);
    }
}

impl fmt::Debug for dyn MetricsSink {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "MetricsSink")
    }
}

/// A sink that drops everything. Used wherever no sink was configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {}

/// Convenience for optional-sink call sites.
pub(crate) fn sink_or_null(sink: Option<Arc<dyn MetricsSink>>) -> Arc<dyn MetricsSink> {
    sink.unwrap_or_else(|| Arc::new(NullMetricsSink))
}
