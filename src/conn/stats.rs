use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::ConnectionState;

/// Atomic counters backing a connection's statistics. Updated on every
/// I/O completion; readers never observe torn values.
#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) bytes_read: AtomicU64,
    pub(super) bytes_written: AtomicU64,
    pub(super) read_ops: AtomicU64,
    pub(super) write_ops: AtomicU64,
    pub(super) error_count: AtomicU64,
}

impl Counters {
    pub(super) fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of a connection's statistics, from
/// [`ManagedConnection::stats`](super::ManagedConnection::stats).
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// The connection's process-unique id.
    pub id: String,
    /// The remote endpoint as dialed or accepted.
    pub remote: String,
    /// The local socket address, when the socket is still open.
    pub local: Option<String>,
    /// Transport tag: `"tcp"` or `"tls"`.
    pub protocol: &'static str,
    /// Lifecycle state at snapshot time.
    pub state: ConnectionState,
    /// Total bytes successfully read.
    pub bytes_read: u64,
    /// Total bytes successfully written.
    pub bytes_written: u64,
    /// Completed read operations.
    pub read_ops: u64,
    /// Completed write operations.
    pub write_ops: u64,
    /// I/O errors observed over the connection's lifetime.
    pub error_count: u64,
    /// Text of the most recent error, if any.
    pub last_error: Option<String>,
    /// Seconds since the connection was established.
    pub age_secs: u64,
    /// Seconds since the last state change or completed I/O.
    pub idle_secs: u64,
    /// The health flag as maintained by the background monitor.
    pub healthy: bool,
}
