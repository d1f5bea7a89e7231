//! A resilient connection fabric for dual-stack networking.
//!
//! `netfabric` is the transport core of a general-purpose network utility:
//! it establishes outgoing connections that shrug off transient failure
//! (retry with back-off, per-target circuit breaking, Happy Eyeballs
//! racing), reuses them through a bounded health-checked pool, moves bytes
//! under per-direction rate limits with optional transparent gzip
//! compression, accepts inbound traffic on IPv4 and IPv6 simultaneously,
//! schedules cancellable prioritized work on an elastic worker pool, and
//! rolls subsystem health up into a single status.
//!
//! # Dialing
//!
//! ```no_run
//! use netfabric::{Dialer, DialerOptions};
//!
//! # async fn demo() -> netfabric::Result<()> {
//! let dialer = Dialer::new(DialerOptions::default());
//! let conn = dialer.dial("example.com:4444").await?;
//! conn.write(b"hello").await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Pooling
//!
//! ```no_run
//! use netfabric::{ConnectionPool, PoolOptions};
//!
//! # async fn demo() -> netfabric::Result<()> {
//! let pool = ConnectionPool::new(PoolOptions::default());
//! let conn = pool.get("example.com:4444").await?;
//! conn.write(b"ping").await?;
//! pool.put(conn).await?;
//! # Ok(())
//! # }
//! ```
//!
//! All blocking operations observe cancellation: connections carry a
//! [`CancellationToken`] (see [`ManagedConnection::context`]), worker
//! tasks receive one, and listeners stop accepting when closed. The
//! library installs no logging subscriber and owns no global state;
//! construct instances and wire them together.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod buffer;
pub mod conn;
pub mod dial;
pub mod error;
pub mod event;
pub mod exec;
pub mod health;
pub mod limit;
pub mod listen;
pub mod options;
pub mod pool;
mod runtime;
mod serde_util;

pub use tokio_util::sync::CancellationToken;

#[cfg(feature = "rustls-tls")]
pub use crate::runtime::tls::TlsOptions;
pub use crate::{
    buffer::{BufferPool, BufferPoolOptions, BufferPoolStats, PooledBuffer},
    conn::{ConnectionState, ConnectionStats, ManagedConnection},
    dial::{CircuitBreaker, CircuitState, Dialer, DialerOptions, DualStackOptions},
    error::{Error, ErrorKind, Result},
    event::{MetricsSink, NullMetricsSink, Tag},
    exec::{Task, WorkerPool, WorkerPoolOptions, WorkerPoolStats},
    health::{
        AggregatedHealth, HealthChecker, HealthManager, HealthResult, HealthStatus,
    },
    limit::{ByteRate, RateLimiter, TokenBucket},
    listen::{DualStackListener, ListenerOptions},
    options::{Address, AddressFamily},
    pool::{ConnectionPool, PoolOptions, PoolStats},
};

/// Dials `target` with default options. Shorthand for
/// [`Dialer::dial`] on a freshly constructed default dialer; construct a
/// [`Dialer`] explicitly to share circuit breakers across dials.
pub async fn dial(target: impl AsRef<str>) -> Result<ManagedConnection> {
    Dialer::default().dial(target).await
}

/// Dials `target` and performs a TLS handshake with the given options.
#[cfg(feature = "rustls-tls")]
pub async fn dial_tls(
    target: impl AsRef<str>,
    tls_options: TlsOptions,
) -> Result<ManagedConnection> {
    Dialer::default().dial_tls(target, tls_options).await
}
