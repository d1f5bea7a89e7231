//! The managed connection: a byte-stream socket wrapped with lifecycle
//! state, statistics, optional pacing, and optional transparent
//! compression.

mod compression;
mod stats;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

use rand::Rng;
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

pub use self::stats::ConnectionStats;
use self::{
    compression::{GzipReader, GzipWriter},
    stats::Counters,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::{self, MetricsSink, Tag},
    limit::{ByteRate, TokenBucket},
    options::{Address, AddressFamily},
    runtime::{self, stream::AsyncStream},
};

/// Cadence of the per-connection background health evaluation.
const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Idle time after which the monitor marks a connection unhealthy.
const MAX_IDLE_BEFORE_UNHEALTHY: Duration = Duration::from_secs(300);

/// Grace added to a limiter's own estimate before a wait counts as starved.
const PACING_GRACE: Duration = Duration::from_millis(50);

/// Pause before the single retry after a starved limiter wait.
const PACING_BACKOFF: Duration = Duration::from_millis(10);

static NEXT_CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a [`ManagedConnection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Being established; not yet usable.
    Connecting,
    /// Established and usable.
    Connected,
    /// Close in progress.
    Closing,
    /// Fully closed. Terminal: a closed connection never re-opens.
    Closed,
    /// An unrecoverable error was observed.
    Error,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    last_activity: Instant,
    last_error: Option<String>,
}

enum ReadEnd {
    Plain(ReadHalf<AsyncStream>),
    Gzip(Box<GzipReader<ReadHalf<AsyncStream>>>),
    /// Transient placeholder while the end is being rewrapped or after
    /// close tore it down.
    Detached,
}

enum WriteEnd {
    Plain(WriteHalf<AsyncStream>),
    Gzip(Box<GzipWriter<WriteHalf<AsyncStream>>>),
    Detached,
}

struct ConnectionInner {
    id: String,
    address: Address,
    local: Option<SocketAddr>,
    protocol: &'static str,
    created_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    counters: Counters,
    healthy: AtomicBool,
    cancel: CancellationToken,
    reader: tokio::sync::Mutex<ReadEnd>,
    writer: tokio::sync::Mutex<WriteEnd>,
    read_limiter: RwLock<Option<Arc<TokenBucket>>>,
    write_limiter: RwLock<Option<Arc<TokenBucket>>>,
    read_timeout: RwLock<Option<Duration>>,
    write_timeout: RwLock<Option<Duration>>,
    compressed: AtomicBool,
    metrics: RwLock<Option<Arc<dyn MetricsSink>>>,
}

/// A pooled, instrumented wrapper around an established socket.
///
/// Cloning is cheap and clones share all state; the connection pool hands
/// out clones and tracks membership by [`id`](Self::id). Reads and writes
/// may run concurrently with each other; concurrent reads (or concurrent
/// writes) interleave bytes and are the caller's responsibility to order.
#[derive(Clone)]
pub struct ManagedConnection {
    inner: Arc<ConnectionInner>,
}

impl ManagedConnection {
    /// Wraps an established outbound stream.
    pub(crate) fn establish(
        stream: AsyncStream,
        address: Address,
        protocol: &'static str,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        let local = stream.local_addr().ok();
        let (read_half, write_half) = tokio::io::split(stream);

        let inner = Arc::new(ConnectionInner {
            id: next_connection_id(),
            address,
            local,
            protocol,
            created_at: Instant::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connected,
                last_activity: Instant::now(),
                last_error: None,
            }),
            counters: Counters::default(),
            healthy: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            reader: tokio::sync::Mutex::new(ReadEnd::Plain(read_half)),
            writer: tokio::sync::Mutex::new(WriteEnd::Plain(write_half)),
            read_limiter: RwLock::new(None),
            write_limiter: RwLock::new(None),
            read_timeout: RwLock::new(None),
            write_timeout: RwLock::new(None),
            compressed: AtomicBool::new(false),
            metrics: RwLock::new(metrics),
        });

        spawn_health_monitor(&inner);
        tracing::debug!(id = %inner.id, address = %inner.address, protocol, "connection established");

        Self { inner }
    }

    /// Wraps a socket accepted by a listener.
    pub(crate) fn accepted(stream: tokio::net::TcpStream, peer: SocketAddr) -> Self {
        let address = Address {
            host: peer.ip().to_string(),
            port: peer.port(),
            family: if peer.is_ipv4() {
                AddressFamily::V4
            } else {
                AddressFamily::V6
            },
        };
        Self::establish(AsyncStream::Tcp(stream), address, "tcp", None)
    }

    /// The connection's process-unique identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The remote endpoint.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// The local socket address, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    /// Transport tag: `"tcp"` or `"tls"`.
    pub fn protocol(&self) -> &'static str {
        self.inner.protocol
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().unwrap().state
    }

    /// The health flag maintained by the background monitor and state
    /// transitions.
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// The connection's cancellation token. Cancelling it aborts in-flight
    /// I/O with a cancellation error and closes the connection.
    pub fn context(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Attaches a metrics sink for per-connection counters.
    pub fn set_metrics(&self, sink: Arc<dyn MetricsSink>) {
        *self.inner.metrics.write().unwrap() = Some(sink);
    }

    /// Applies `bytes_per_second` pacing to both directions. The burst is
    /// a tenth of the rate with a 1 KiB floor.
    pub fn set_rate_limit(&self, bytes_per_second: u64) {
        let rate = ByteRate {
            bytes_per_sec: bytes_per_second,
            burst: (bytes_per_second / 10).max(1024),
        };
        *self.inner.read_limiter.write().unwrap() = Some(Arc::new(TokenBucket::from_rate(rate)));
        *self.inner.write_limiter.write().unwrap() = Some(Arc::new(TokenBucket::from_rate(rate)));
    }

    /// Paces reads only.
    pub fn set_read_rate_limit(&self, rate: ByteRate) {
        *self.inner.read_limiter.write().unwrap() = Some(Arc::new(TokenBucket::from_rate(rate)));
    }

    /// Paces writes only.
    pub fn set_write_rate_limit(&self, rate: ByteRate) {
        *self.inner.write_limiter.write().unwrap() = Some(Arc::new(TokenBucket::from_rate(rate)));
    }

    /// Deadline applied to each subsequent read. `None` clears it.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.inner.read_timeout.write().unwrap() = timeout;
    }

    /// Deadline applied to each subsequent write. `None` clears it.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.inner.write_timeout.write().unwrap() = timeout;
    }

    /// Reads into `buf`, returning the number of bytes read. `Ok(0)` means
    /// the peer closed the stream; the connection transitions to `Closed`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_connected()?;
        self.pace(&self.inner.read_limiter, buf.len() as u64, "read")
            .await?;

        let timeout = *self.inner.read_timeout.read().unwrap();
        let mut guard = self.inner.reader.lock().await;
        let outcome = {
            let io = async {
                match &mut *guard {
                    ReadEnd::Plain(r) => Ok(r.read(buf).await?),
                    ReadEnd::Gzip(r) => r.read(buf).await,
                    ReadEnd::Detached => Err(Error::resource_closed("connection")),
                }
            };
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)),
                result = maybe_timeout(timeout, io) => result,
            }
        };
        drop(guard);

        match outcome {
            Ok(0) if !buf.is_empty() => {
                self.transition(ConnectionState::Closed);
                self.inner.cancel.cancel();
                Ok(0)
            }
            Ok(n) => {
                self.inner.counters.record_read(n as u64);
                self.touch();
                self.emit_bytes(event::CONNECTION_BYTES_READ, n);
                Ok(n)
            }
            Err(e) => Err(self.register_error(e)),
        }
    }

    /// Writes all of `buf`, returning its length. With compression
    /// enabled the frame is flushed before this returns, so the peer can
    /// observe the bytes.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_connected()?;
        self.pace(&self.inner.write_limiter, buf.len() as u64, "write")
            .await?;

        let timeout = *self.inner.write_timeout.read().unwrap();
        let mut guard = self.inner.writer.lock().await;
        let outcome = {
            let io = async {
                match &mut *guard {
                    WriteEnd::Plain(w) => {
                        w.write_all(buf).await?;
                        Ok(())
                    }
                    WriteEnd::Gzip(w) => w.write_all(buf).await,
                    WriteEnd::Detached => Err(Error::resource_closed("connection")),
                }
            };
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)),
                result = maybe_timeout(timeout, io) => result,
            }
        };
        drop(guard);

        match outcome {
            Ok(()) => {
                self.inner.counters.record_write(buf.len() as u64);
                self.touch();
                self.emit_bytes(event::CONNECTION_BYTES_WRITTEN, buf.len());
                Ok(buf.len())
            }
            Err(e) => Err(self.register_error(e)),
        }
    }

    /// Wraps both directions in a gzip stream codec. Fails if compression
    /// is already enabled.
    pub async fn enable_compression(&self) -> Result<()> {
        if self.inner.compressed.swap(true, Ordering::SeqCst) {
            return Err(Error::validation(
                "compression is already enabled on this connection",
            ));
        }

        let mut reader = self.inner.reader.lock().await;
        let mut writer = self.inner.writer.lock().await;

        *reader = match std::mem::replace(&mut *reader, ReadEnd::Detached) {
            ReadEnd::Plain(r) => ReadEnd::Gzip(Box::new(GzipReader::new(r))),
            other => other,
        };
        *writer = match std::mem::replace(&mut *writer, WriteEnd::Detached) {
            WriteEnd::Plain(w) => WriteEnd::Gzip(Box::new(GzipWriter::new(w))),
            other => other,
        };

        tracing::debug!(id = %self.inner.id, "compression enabled");
        Ok(())
    }

    /// Closes the connection: cancels its token, shuts the socket down,
    /// and reports the connection's lifetime to the metrics sink.
    /// Idempotent; closing a closed connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if matches!(
                lifecycle.state,
                ConnectionState::Closed | ConnectionState::Closing
            ) {
                return Ok(());
            }
            lifecycle.state = ConnectionState::Closing;
            lifecycle.last_activity = Instant::now();
        }
        self.inner.healthy.store(false, Ordering::Release);
        self.inner.cancel.cancel();

        let mut writer = self.inner.writer.lock().await;
        let shutdown = match std::mem::replace(&mut *writer, WriteEnd::Detached) {
            WriteEnd::Plain(mut w) => w.shutdown().await.map_err(Error::from),
            WriteEnd::Gzip(mut w) => w.shutdown().await,
            WriteEnd::Detached => Ok(()),
        };
        drop(writer);

        self.transition(ConnectionState::Closed);

        if let Err(e) = shutdown {
            tracing::debug!(id = %self.inner.id, error = %e, "socket shutdown during close");
        }

        let sink = self.inner.metrics.read().unwrap().clone();
        if let Some(sink) = sink {
            sink.record_timer(
                event::CONNECTION_DURATION,
                self.inner.created_at.elapsed(),
                &self.tags(),
            );
        }

        tracing::debug!(id = %self.inner.id, "connection closed");
        Ok(())
    }

    /// A snapshot of the connection's statistics.
    pub fn stats(&self) -> ConnectionStats {
        let (state, last_error, idle) = {
            let lifecycle = self.inner.lifecycle.lock().unwrap();
            (
                lifecycle.state,
                lifecycle.last_error.clone(),
                lifecycle.last_activity.elapsed(),
            )
        };
        ConnectionStats {
            id: self.inner.id.clone(),
            remote: self.inner.address.to_string(),
            local: self.inner.local.map(|a| a.to_string()),
            protocol: self.inner.protocol,
            state,
            bytes_read: self.inner.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.inner.counters.bytes_written.load(Ordering::Relaxed),
            read_ops: self.inner.counters.read_ops.load(Ordering::Relaxed),
            write_ops: self.inner.counters.write_ops.load(Ordering::Relaxed),
            error_count: self.inner.counters.error_count.load(Ordering::Relaxed),
            last_error,
            age_secs: self.inner.created_at.elapsed().as_secs(),
            idle_secs: idle.as_secs(),
            healthy: self.is_healthy(),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        let state = self.state();
        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(Error::resource_closed("connection")
                .with_context("state", format!("{:?}", state)))
        }
    }

    async fn pace(
        &self,
        limiter: &RwLock<Option<Arc<TokenBucket>>>,
        n: u64,
        direction: &'static str,
    ) -> Result<()> {
        let bucket = match limiter.read().unwrap().clone() {
            Some(bucket) => bucket,
            None => return Ok(()),
        };

        let budget = (bucket.eta(n).saturating_mul(2) + PACING_GRACE).min(Duration::from_secs(5));
        for attempt in 0..2 {
            let waited = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {
                    return Err(self.register_error(Error::new(ErrorKind::Cancelled)));
                }
                outcome = tokio::time::timeout(budget, bucket.wait(n)) => outcome,
            };
            if waited.is_ok() {
                return Ok(());
            }
            if attempt == 0 {
                tokio::time::sleep(PACING_BACKOFF).await;
            }
        }

        Err(ErrorKind::RateLimitExceeded {
            message: format!("{} of {} bytes starved by the rate limiter", direction, n),
        }
        .into())
    }

    fn register_error(&self, error: Error) -> Error {
        self.inner.counters.record_error();

        let closed = error.is_closed_class();
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            lifecycle.last_error = Some(error.to_string());
            lifecycle.last_activity = Instant::now();
            if closed && lifecycle.state != ConnectionState::Closed {
                lifecycle.state = ConnectionState::Closed;
            } else if !closed
                && !error.is_cancelled()
                && !matches!(error.kind.as_ref(), ErrorKind::Timeout | ErrorKind::RateLimitExceeded { .. })
            {
                lifecycle.state = ConnectionState::Error;
            }
        }

        match self.state() {
            ConnectionState::Closed | ConnectionState::Error => {
                self.inner.healthy.store(false, Ordering::Release);
                if closed || error.is_cancelled() {
                    self.inner.cancel.cancel();
                }
            }
            _ => {}
        }

        error.with_context("connection_id", self.inner.id.clone())
    }

    fn transition(&self, state: ConnectionState) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if lifecycle.state == ConnectionState::Closed && state != ConnectionState::Closed {
            // Closed is terminal.
            return;
        }
        lifecycle.state = state;
        lifecycle.last_activity = Instant::now();
        drop(lifecycle);

        if matches!(state, ConnectionState::Closed | ConnectionState::Error) {
            self.inner.healthy.store(false, Ordering::Release);
        }
    }

    fn touch(&self) {
        self.inner.lifecycle.lock().unwrap().last_activity = Instant::now();
    }

    fn tags(&self) -> [Tag; 2] {
        [
            ("id", self.inner.id.clone()),
            ("protocol", self.inner.protocol.to_string()),
        ]
    }

    fn emit_bytes(&self, name: &'static str, n: usize) {
        let sink = self.inner.metrics.read().unwrap().clone();
        if let Some(sink) = sink {
            sink.record_histogram(name, n as f64, &self.tags());
        }
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("ManagedConnection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("protocol", &self.inner.protocol)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionInner {
    fn evaluate_health(&self) {
        let (state, idle) = {
            let lifecycle = self.lifecycle.lock().unwrap();
            (lifecycle.state, lifecycle.last_activity.elapsed())
        };
        if matches!(state, ConnectionState::Closed | ConnectionState::Error)
            || idle > MAX_IDLE_BEFORE_UNHEALTHY
        {
            if self.healthy.swap(false, Ordering::AcqRel) {
                tracing::debug!(id = %self.id, ?state, ?idle, "connection marked unhealthy");
            }
        }
    }
}

fn spawn_health_monitor(inner: &Arc<ConnectionInner>) {
    let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
    let token = inner.cancel.clone();
    runtime::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_MONITOR_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            match weak.upgrade() {
                Some(inner) => inner.evaluate_health(),
                None => break,
            }
        }
    });
}

async fn maybe_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .unwrap_or_else(|elapsed| Err(elapsed.into())),
        None => fut.await,
    }
}

fn next_connection_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let seq = NEXT_CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
    let suffix: [u8; 4] = rand::rng().random();
    format!("{:012x}-{:04x}-{}", millis, seq & 0xffff, hex::encode(suffix))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::{ConnectionState, ManagedConnection};
    use crate::{options::Address, runtime::stream::AsyncStream};

    async fn pair() -> (ManagedConnection, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = ManagedConnection::establish(
            AsyncStream::Tcp(client),
            Address::parse(format!("127.0.0.1:{}", addr.port())).unwrap(),
            "tcp",
            None,
        );
        (conn, server)
    }

    #[tokio::test]
    async fn reads_and_writes_update_stats() {
        let (conn, mut server) = pair().await;

        conn.write(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong!");

        let stats = conn.stats();
        assert_eq!(stats.bytes_written, 4);
        assert_eq!(stats.bytes_read, 5);
        assert_eq!(stats.write_ops, 1);
        assert_eq!(stats.read_ops, 1);
        assert!(stats.healthy);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let (a, _sa) = pair().await;
        let (b, _sb) = pair().await;
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let (conn, _server) = pair().await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_healthy());

        let err = conn.write(b"nope").await.unwrap_err();
        assert_eq!(err.code(), "resource.closed");
    }

    #[tokio::test]
    async fn peer_eof_closes_the_connection() {
        let (conn, server) = pair().await;
        drop(server);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.context().is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_aborts_a_blocked_read() {
        let (conn, _server) = pair().await;
        let token = conn.context();

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                conn.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "cancellation.context");
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn read_timeout_fires_without_closing() {
        let (conn, _server) = pair().await;
        conn.set_read_timeout(Some(Duration::from_millis(50)));

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.code(), "network.timeout");
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.stats().error_count, 1);
    }

    #[tokio::test]
    async fn enabling_compression_twice_fails() {
        let (conn, _server) = pair().await;
        conn.enable_compression().await.unwrap();
        let err = conn.enable_compression().await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn compressed_peers_exchange_plaintext() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let a = ManagedConnection::establish(
            AsyncStream::Tcp(client),
            Address::parse(format!("127.0.0.1:{}", addr.port())).unwrap(),
            "tcp",
            None,
        );
        let b = ManagedConnection::accepted(server, peer);
        a.enable_compression().await.unwrap();
        b.enable_compression().await.unwrap();

        a.write(b"compressed hello").await.unwrap();
        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"compressed hello");
    }

    #[tokio::test]
    async fn rate_limited_writes_wait_for_tokens() {
        let (conn, mut server) = pair().await;
        // 1 KiB burst at 10 KiB/s: two 1 KiB writes must straddle ~100 ms.
        conn.set_rate_limit(10 * 1024);

        let start = tokio::time::Instant::now();
        conn.write(&[0u8; 1024]).await.unwrap();
        conn.write(&[0u8; 1024]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));

        let mut buf = vec![0u8; 2048];
        server.read_exact(&mut buf).await.unwrap();
    }
}
