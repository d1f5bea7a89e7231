//! A keyed pool of idle managed connections with strict lifecycle rules.

mod background;
mod options;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use self::options::PoolOptions;
use crate::{
    conn::ManagedConnection,
    dial::Dialer,
    error::{Error, ErrorKind, Result},
    event::{self, MetricsSink, Tag},
    health::{HealthResult, HealthStatus},
    options::Address,
};

/// Why a pool entry was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExpireReason {
    Idle,
    Lifetime,
    Unhealthy,
    Cleared,
    PoolClosed,
}

impl ExpireReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Lifetime => "lifetime",
            Self::Unhealthy => "unhealthy",
            Self::Cleared => "cleared",
            Self::PoolClosed => "pool_closed",
        }
    }
}

/// Pool bookkeeping wrapped around one managed connection.
struct PoolEntry {
    conn: ManagedConnection,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    in_use: bool,
}

impl PoolEntry {
    fn new(conn: ManagedConnection, in_use: bool) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            use_count: 0,
            in_use,
        }
    }

    fn expire_reason(&self, options: &PoolOptions) -> Option<ExpireReason> {
        if !self.conn.is_healthy() {
            return Some(ExpireReason::Unhealthy);
        }
        if let Some(max_lifetime) = options.max_lifetime {
            if self.created_at.elapsed() > max_lifetime {
                return Some(ExpireReason::Lifetime);
            }
        }
        if let Some(max_idle) = options.max_idle_time {
            if !self.in_use && self.last_used.elapsed() > max_idle {
                return Some(ExpireReason::Idle);
            }
        }
        None
    }
}

#[derive(Default)]
struct Bucket {
    entries: Vec<PoolEntry>,
    /// Dials in flight for this bucket; counted against `max_size`.
    pending: usize,
}

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    reuses: AtomicU64,
    expired: AtomicU64,
}

/// Counters describing pool activity, from [`ConnectionPool::stats`].
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct PoolStats {
    /// Gets satisfied from an idle entry.
    pub hits: u64,
    /// Gets that had to dial.
    pub misses: u64,
    /// Connections the pool has created.
    pub created: u64,
    /// Times an entry was handed out again after a put.
    pub reuses: u64,
    /// Entries discarded for expiry, health, or close.
    pub expired: u64,
    /// Live connections per target, counting checked-out ones.
    pub bucket_sizes: HashMap<String, usize>,
}

struct PoolInner {
    options: PoolOptions,
    dialer: Dialer,
    buckets: RwLock<HashMap<Address, Bucket>>,
    counters: PoolCounters,
    closed: AtomicBool,
    maintenance_token: CancellationToken,
    metrics: RwLock<Option<Arc<dyn MetricsSink>>>,
}

/// A pool of [`ManagedConnection`]s keyed by target address.
///
/// `get` prefers a healthy idle entry, dials on a miss while the target's
/// bucket has room, and fails with `pool.exhausted` otherwise. `put`
/// returns an entry to idle or discards it if it expired while out.
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool and, unless disabled, starts its maintenance worker.
    pub fn new(options: PoolOptions) -> Self {
        let dialer = Dialer::new(options.dialer.clone());
        let maintenance_token = CancellationToken::new();

        let inner = Arc::new(PoolInner {
            options,
            dialer,
            buckets: RwLock::new(HashMap::new()),
            counters: PoolCounters::default(),
            closed: AtomicBool::new(false),
            maintenance_token: maintenance_token.clone(),
            metrics: RwLock::new(None),
        });

        if inner.options.enable_health_check {
            background::start_maintenance_worker(Arc::downgrade(&inner), maintenance_token);
        }

        Self { inner }
    }

    /// Attaches a metrics sink; it is also propagated to the pool's dialer.
    pub fn set_metrics(&self, sink: Arc<dyn MetricsSink>) {
        self.inner.dialer.set_metrics(sink.clone());
        *self.inner.metrics.write().unwrap() = Some(sink);
    }

    /// Checks out a connection for `target`, reusing a pooled entry when a
    /// healthy one is idle and dialing otherwise.
    pub async fn get(&self, target: impl AsRef<str>) -> Result<ManagedConnection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ErrorKind::PoolClosed.into());
        }
        let address = Address::parse(target.as_ref())?;

        // Reuse path, and slot reservation for the dial path.
        let mut discarded = Vec::new();
        let reused = {
            let mut buckets = self.inner.buckets.write().unwrap();
            let bucket = buckets.entry(address.clone()).or_default();

            // Expired idle entries are discarded on sight so they can't
            // block the bucket.
            let options = &self.inner.options;
            let mut i = 0;
            let mut found = None;
            while i < bucket.entries.len() {
                let entry = &mut bucket.entries[i];
                if entry.in_use {
                    i += 1;
                    continue;
                }
                match entry.expire_reason(options) {
                    Some(reason) => {
                        let entry = bucket.entries.swap_remove(i);
                        discarded.push((entry.conn, reason));
                    }
                    None => {
                        entry.in_use = true;
                        entry.last_used = Instant::now();
                        found = Some(entry.conn.clone());
                        break;
                    }
                }
            }

            match found {
                Some(conn) => Some(conn),
                None => {
                    if bucket.entries.len() + bucket.pending >= self.inner.options.max_size {
                        self.record_discards(&address, &discarded);
                        drop(buckets);
                        self.close_discarded(discarded).await;
                        return Err(ErrorKind::PoolExhausted { address }.into());
                    }
                    bucket.pending += 1;
                    None
                }
            }
        };

        self.record_discards(&address, &discarded);
        self.close_discarded(discarded).await;

        if let Some(conn) = reused {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.inner.counters.reuses.fetch_add(1, Ordering::Relaxed);
            self.emit(event::POOL_HITS, &address);
            return Ok(conn);
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.emit(event::POOL_MISSES, &address);

        let dialed = tokio::time::timeout(
            self.inner.options.connection_timeout,
            self.inner.dialer.dial(address.to_string()),
        )
        .await
        .unwrap_or_else(|elapsed| Err(Error::from(elapsed)));

        let mut buckets = self.inner.buckets.write().unwrap();
        let bucket = buckets.entry(address.clone()).or_default();
        bucket.pending = bucket.pending.saturating_sub(1);

        match dialed {
            Ok(conn) => {
                if self.inner.closed.load(Ordering::Acquire) {
                    // The pool was closed while this dial was in flight.
                    drop(buckets);
                    let _ = conn.close().await;
                    return Err(ErrorKind::PoolClosed.into());
                }
                bucket.entries.push(PoolEntry::new(conn.clone(), true));
                drop(buckets);
                self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                self.emit(event::CONNECTIONS_CREATED, &address);
                Ok(conn)
            }
            Err(e) => {
                drop(buckets);
                Err(e.with_context("operation", "Failed to create pooled connection"))
            }
        }
    }

    /// Returns a connection to the pool. Foreign connections and entries
    /// that expired while checked out are closed instead of re-idled.
    /// Always safe to call.
    pub async fn put(&self, conn: ManagedConnection) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            conn.close().await?;
            return Ok(());
        }

        let address = conn.address().clone();
        enum Verdict {
            Foreign,
            Idled,
            Expired(ManagedConnection, ExpireReason),
        }

        let verdict = {
            let mut buckets = self.inner.buckets.write().unwrap();
            match buckets.get_mut(&address) {
                None => Verdict::Foreign,
                Some(bucket) => {
                    match bucket
                        .entries
                        .iter()
                        .position(|entry| entry.conn.id() == conn.id())
                    {
                        None => Verdict::Foreign,
                        Some(index) => {
                            let entry = &mut bucket.entries[index];
                            entry.in_use = false;
                            entry.use_count += 1;
                            entry.last_used = Instant::now();

                            match entry.expire_reason(&self.inner.options) {
                                Some(reason) => {
                                    let entry = bucket.entries.swap_remove(index);
                                    Verdict::Expired(entry.conn, reason)
                                }
                                None => Verdict::Idled,
                            }
                        }
                    }
                }
            }
        };

        match verdict {
            Verdict::Foreign => self.close_foreign(conn).await,
            Verdict::Idled => Ok(()),
            Verdict::Expired(conn, reason) => {
                self.record_discards(&address, std::slice::from_ref(&(conn.clone(), reason)));
                conn.close().await
            }
        }
    }

    /// Drops every entry for `target`. Idle connections are closed
    /// immediately; checked-out ones are forgotten, so their `put` closes
    /// them instead of re-idling them.
    pub async fn clear(&self, target: impl AsRef<str>) -> Result<()> {
        let address = Address::parse(target.as_ref())?;
        let entries: Vec<PoolEntry> = {
            let mut buckets = self.inner.buckets.write().unwrap();
            match buckets.remove(&address) {
                Some(bucket) => bucket.entries,
                None => return Ok(()),
            }
        };

        tracing::debug!(address = %address, entries = entries.len(), "pool bucket cleared");
        for entry in entries {
            self.inner.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.emit_expired(&address, ExpireReason::Cleared);
            if !entry.in_use {
                let _ = entry.conn.close().await;
            }
        }
        Ok(())
    }

    /// Aggregated pool health: unhealthy when more than half of all
    /// entries are unhealthy.
    pub fn health_check(&self) -> HealthResult {
        let (total, unhealthy) = {
            let buckets = self.inner.buckets.read().unwrap();
            let mut total = 0usize;
            let mut unhealthy = 0usize;
            for bucket in buckets.values() {
                for entry in &bucket.entries {
                    total += 1;
                    if !entry.conn.is_healthy() {
                        unhealthy += 1;
                    }
                }
            }
            (total, unhealthy)
        };

        let status = if total > 0 && unhealthy * 2 > total {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        HealthResult::new(
            "connection_pool",
            status,
            format!("{} of {} pooled connections unhealthy", unhealthy, total),
        )
    }

    /// A snapshot of the pool's counters and per-target sizes.
    pub fn stats(&self) -> PoolStats {
        let bucket_sizes = {
            let buckets = self.inner.buckets.read().unwrap();
            buckets
                .iter()
                .map(|(address, bucket)| (address.to_string(), bucket.entries.len()))
                .collect()
        };
        PoolStats {
            hits: self.inner.counters.hits.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            created: self.inner.counters.created.load(Ordering::Relaxed),
            reuses: self.inner.counters.reuses.load(Ordering::Relaxed),
            expired: self.inner.counters.expired.load(Ordering::Relaxed),
            bucket_sizes,
        }
    }

    /// Stops maintenance, closes every held connection, and clears all
    /// buckets. Subsequent `get`s fail with `pool.closed`; `put` closes
    /// the connection directly.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.maintenance_token.cancel();

        let entries: Vec<PoolEntry> = {
            let mut buckets = self.inner.buckets.write().unwrap();
            buckets
                .drain()
                .flat_map(|(_, bucket)| bucket.entries)
                .collect()
        };

        for entry in entries {
            self.inner
                .counters
                .expired
                .fetch_add(1, Ordering::Relaxed);
            self.emit_expired(entry.conn.address(), ExpireReason::PoolClosed);
            let _ = entry.conn.close().await;
        }
        tracing::debug!("connection pool closed");
    }

    async fn close_foreign(&self, conn: ManagedConnection) -> Result<()> {
        tracing::debug!(id = %conn.id(), "foreign connection returned to pool; closing");
        conn.close().await
    }

    async fn close_discarded(&self, discarded: Vec<(ManagedConnection, ExpireReason)>) {
        for (conn, _) in discarded {
            let _ = conn.close().await;
        }
    }

    fn record_discards(&self, address: &Address, discarded: &[(ManagedConnection, ExpireReason)]) {
        for (_, reason) in discarded {
            self.inner
                .counters
                .expired
                .fetch_add(1, Ordering::Relaxed);
            self.emit_expired(address, *reason);
        }
    }

    fn emit(&self, name: &'static str, address: &Address) {
        let sink = self.inner.metrics.read().unwrap().clone();
        if let Some(sink) = sink {
            sink.increment_counter(name, &[("address", address.to_string())]);
        }
    }

    fn emit_expired(&self, address: &Address, reason: ExpireReason) {
        let sink = self.inner.metrics.read().unwrap().clone();
        if let Some(sink) = sink {
            let tags: [Tag; 2] = [
                ("address", address.to_string()),
                ("reason", reason.as_str().to_string()),
            ];
            sink.increment_counter(event::CONNECTIONS_EXPIRED, &tags);
        }
    }
}

impl PoolInner {
    /// One maintenance sweep: discard expired or unhealthy idle entries,
    /// then pre-warm buckets below `min_size`.
    async fn perform_maintenance(self: &Arc<Self>) {
        let mut discarded = Vec::new();
        let mut to_warm = Vec::new();
        {
            let mut buckets = self.buckets.write().unwrap();
            for (address, bucket) in buckets.iter_mut() {
                let options = &self.options;
                let mut i = 0;
                while i < bucket.entries.len() {
                    let entry = &bucket.entries[i];
                    let reason = if entry.in_use {
                        None
                    } else {
                        entry.expire_reason(options)
                    };
                    match reason {
                        Some(reason) => {
                            let entry = bucket.entries.swap_remove(i);
                            discarded.push((address.clone(), entry.conn, reason));
                        }
                        None => i += 1,
                    }
                }

                let live = bucket.entries.len() + bucket.pending;
                if live < self.options.min_size {
                    to_warm.push((address.clone(), self.options.min_size - live));
                }
            }
        }

        for (address, conn, reason) in discarded {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                address = %address,
                id = %conn.id(),
                reason = reason.as_str(),
                "pool entry expired"
            );
            let sink = self.metrics.read().unwrap().clone();
            if let Some(sink) = sink {
                sink.increment_counter(
                    event::CONNECTIONS_EXPIRED,
                    &[
                        ("address", address.to_string()),
                        ("reason", reason.as_str().to_string()),
                    ],
                );
            }
            let _ = conn.close().await;
        }

        for (address, deficit) in to_warm {
            self.prewarm(address, deficit).await;
        }
    }

    /// Dial up to `deficit` idle connections for `address`. Failures are
    /// left for the next sweep.
    async fn prewarm(self: &Arc<Self>, address: Address, deficit: usize) {
        for _ in 0..deficit {
            match tokio::time::timeout(
                self.options.connection_timeout,
                self.dialer.dial(address.to_string()),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    let overflow = {
                        let mut buckets = self.buckets.write().unwrap();
                        let bucket = buckets.entry(address.clone()).or_default();
                        if bucket.entries.len() >= self.options.max_size {
                            Some(conn)
                        } else {
                            bucket.entries.push(PoolEntry::new(conn, false));
                            None
                        }
                    };
                    if let Some(conn) = overflow {
                        let _ = conn.close().await;
                        return;
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(address = %address, error = %e, "pre-warm dial failed");
                    return;
                }
                Err(_) => return,
            }
        }
    }
}
