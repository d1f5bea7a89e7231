//! Size-classed reusable byte buffers with adaptive class creation.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use serde::Serialize;
use typed_builder::TypedBuilder;

/// Size classes every pool starts with, intersected with the configured
/// `[min_size, max_size]` range.
const SEED_CLASSES: &[usize] = &[1024, 4096, 8192, 16384, 32768, 65536];

/// Classes with no activity for this long are removed by `cleanup` in
/// adaptive mode.
const CLASS_IDLE_WINDOW_SECS: u64 = 300;

/// How many recent request sizes are remembered per connection.
const PATTERN_HISTORY: usize = 10;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for a [`BufferPool`].
#[derive(Clone, Debug, TypedBuilder, serde::Deserialize)]
#[builder(field_defaults(default))]
#[serde(default)]
#[non_exhaustive]
pub struct BufferPoolOptions {
    /// The smallest buffer the pool will hand out.
    #[builder(default = 1024)]
    pub min_size: usize,

    /// The largest buffer the pool will hand out; larger requests are
    /// clamped.
    #[builder(default = 1 << 20)]
    pub max_size: usize,

    /// Whether new size classes are created on demand for request sizes
    /// that don't fit an existing class.
    #[builder(default = true)]
    pub adaptive: bool,
}

impl Default for BufferPoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1024,
            max_size: 1 << 20,
            adaptive: true,
        }
    }
}

/// Counters describing pool activity. All updates are atomic.
#[derive(Clone, Debug, Default, Serialize)]
#[non_exhaustive]
pub struct BufferPoolStats {
    /// Buffers allocated fresh.
    pub allocations: u64,
    /// Buffers served from a free list.
    pub reuses: u64,
    /// Gets that found their class's free list empty.
    pub misses: u64,
    /// Bytes currently checked out of the pool.
    pub bytes_in_use: u64,
    /// Number of live size classes.
    pub class_count: usize,
}

#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    reuses: AtomicU64,
    misses: AtomicU64,
    bytes_in_use: AtomicU64,
}

struct SizeClass {
    free: Mutex<Vec<Vec<u8>>>,
    /// Gets served since the last cleanup cycle.
    uses: AtomicU64,
    /// Seconds since pool creation at last activity.
    last_used: AtomicU64,
    /// Seed classes survive cleanup; adaptive ones don't.
    seeded: bool,
}

impl SizeClass {
    fn new(seeded: bool, now: u64) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            uses: AtomicU64::new(0),
            last_used: AtomicU64::new(now),
            seeded,
        }
    }
}

/// A pool of reusable byte buffers quantized into size classes.
///
/// Buffers are zeroed when returned so a reused buffer never leaks bytes
/// between users. Cloning the pool is cheap and clones share state.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    id: u64,
    options: BufferPoolOptions,
    epoch: Instant,
    classes: RwLock<BTreeMap<usize, SizeClass>>,
    patterns: RwLock<HashMap<String, VecDeque<usize>>>,
    counters: Counters,
    closed: AtomicBool,
}

/// A buffer checked out of a [`BufferPool`]. Dereferences to its byte
/// contents; hand it back with [`BufferPool::put`] when done.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool_id: u64,
    class: usize,
}

impl PooledBuffer {
    /// The size class this buffer belongs to.
    pub fn capacity(&self) -> usize {
        self.class
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl BufferPool {
    /// Creates a pool seeded with the standard class set restricted to the
    /// configured size range.
    pub fn new(options: BufferPoolOptions) -> Self {
        let mut classes = BTreeMap::new();
        for &size in SEED_CLASSES {
            if size >= options.min_size && size <= options.max_size {
                classes.insert(size, SizeClass::new(true, 0));
            }
        }

        Self {
            inner: Arc::new(BufferPoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                options,
                epoch: Instant::now(),
                classes: RwLock::new(classes),
                patterns: RwLock::new(HashMap::new()),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Checks a buffer of at least `size` bytes out of the pool. The
    /// returned buffer's length is its class size and its contents are
    /// all zero.
    pub fn get(&self, size: usize) -> PooledBuffer {
        let class = self.find_optimal_size(size);
        let now = self.seconds_since_epoch();

        if !self.inner.closed.load(Ordering::Acquire) {
            let reused = {
                let classes = self.inner.classes.read().unwrap();
                classes.get(&class).and_then(|entry| {
                    entry.uses.fetch_add(1, Ordering::Relaxed);
                    entry.last_used.store(now, Ordering::Relaxed);
                    entry.free.lock().unwrap().pop()
                })
            };

            if let Some(data) = reused {
                self.inner.counters.reuses.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .counters
                    .bytes_in_use
                    .fetch_add(class as u64, Ordering::Relaxed);
                return PooledBuffer {
                    data,
                    pool_id: self.inner.id,
                    class,
                };
            }

            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        }

        self.inner
            .counters
            .allocations
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .bytes_in_use
            .fetch_add(class as u64, Ordering::Relaxed);
        PooledBuffer {
            data: vec![0u8; class],
            pool_id: self.inner.id,
            class,
        }
    }

    /// Returns a buffer to the pool. Buffers from a different pool and
    /// buffers arriving after `close` are dropped without effect. The
    /// buffer's contents are zeroed before it becomes reusable.
    pub fn put(&self, mut buffer: PooledBuffer) {
        if buffer.pool_id != self.inner.id {
            return;
        }

        self.inner
            .counters
            .bytes_in_use
            .fetch_sub(buffer.class as u64, Ordering::Relaxed);

        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        buffer.data.fill(0);
        buffer.data.resize(buffer.class, 0);

        let classes = self.inner.classes.read().unwrap();
        if let Some(entry) = classes.get(&buffer.class) {
            entry.free.lock().unwrap().push(buffer.data);
        }
    }

    /// Removes size classes that saw no activity over the last observation
    /// window. Only adaptive (non-seed) classes are eligible; every class's
    /// activity counter is reset for the next cycle.
    pub fn cleanup(&self) {
        if !self.inner.options.adaptive || self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let now = self.seconds_since_epoch();
        let mut classes = self.inner.classes.write().unwrap();
        let before = classes.len();
        classes.retain(|_, entry| {
            let keep = entry.seeded
                || entry.uses.load(Ordering::Relaxed) > 0
                || now.saturating_sub(entry.last_used.load(Ordering::Relaxed))
                    < CLASS_IDLE_WINDOW_SECS;
            entry.uses.store(0, Ordering::Relaxed);
            keep
        });

        let removed = before - classes.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = classes.len(), "buffer classes pruned");
        }
    }

    /// Records an observed request size for a connection so later gets can
    /// be sized to its traffic.
    pub fn record_connection_pattern(&self, conn_id: &str, size: usize) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let mut patterns = self.inner.patterns.write().unwrap();
        let history = patterns.entry(conn_id.to_string()).or_default();
        history.push_back(size);
        while history.len() > PATTERN_HISTORY {
            history.pop_front();
        }
    }

    /// The class size best matching a connection's recorded traffic, or
    /// `None` when the connection has no recorded pattern.
    pub fn optimal_size_for_connection(&self, conn_id: &str) -> Option<usize> {
        let patterns = self.inner.patterns.read().unwrap();
        let history = patterns.get(conn_id)?;
        if history.is_empty() {
            return None;
        }
        let mean = history.iter().sum::<usize>() / history.len();
        Some(self.find_optimal_size(mean))
    }

    /// A snapshot of the pool's counters.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.inner.counters.allocations.load(Ordering::Relaxed),
            reuses: self.inner.counters.reuses.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            bytes_in_use: self.inner.counters.bytes_in_use.load(Ordering::Relaxed),
            class_count: self.inner.classes.read().unwrap().len(),
        }
    }

    /// Drops every free list and pattern table. Afterwards `put` is a
    /// no-op and `get` falls back to plain allocation.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.classes.write().unwrap().clear();
        self.inner.patterns.write().unwrap().clear();
    }

    /// The smallest class size that can satisfy `request`, creating a new
    /// class in adaptive mode when the quantized size has none.
    fn find_optimal_size(&self, request: usize) -> usize {
        let want = request
            .max(self.inner.options.min_size)
            .min(self.inner.options.max_size);

        {
            let classes = self.inner.classes.read().unwrap();
            if let Some((&size, _)) = classes.range(want..).next() {
                return size;
            }
        }

        if self.inner.options.adaptive && !self.inner.closed.load(Ordering::Acquire) {
            let rounded = want
                .next_power_of_two()
                .min(self.inner.options.max_size);
            let now = self.seconds_since_epoch();
            let mut classes = self.inner.classes.write().unwrap();
            classes
                .entry(rounded)
                .or_insert_with(|| SizeClass::new(false, now));
            return rounded;
        }

        want
    }

    fn seconds_since_epoch(&self) -> u64 {
        self.inner.epoch.elapsed().as_secs()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolOptions::default())
    }
}

#[cfg(test)]
mod test {
    use super::{BufferPool, BufferPoolOptions};

    #[test]
    fn get_rounds_up_to_a_class_and_zeroes() {
        let pool = BufferPool::default();
        let buf = pool.get(3000);
        assert_eq!(buf.capacity(), 4096);
        assert!(buf.len() >= 3000);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn put_then_get_reuses_and_scrubs() {
        let pool = BufferPool::default();
        let mut buf = pool.get(1024);
        buf[0] = 0xAB;
        pool.put(buf);

        let again = pool.get(1024);
        assert_eq!(again[0], 0, "reused buffer must be zeroed");
        assert_eq!(pool.stats().reuses, 1);
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let a = BufferPool::default();
        let b = BufferPool::default();
        let buf = a.get(1024);
        b.put(buf);

        let next = b.get(1024);
        assert_eq!(b.stats().reuses, 0);
        drop(next);
    }

    #[test]
    fn adaptive_mode_creates_classes_on_demand() {
        let pool = BufferPool::new(BufferPoolOptions::builder().max_size(1 << 20).build());
        let buf = pool.get(100_000);
        assert_eq!(buf.capacity(), 131_072);
        assert!(pool.stats().class_count > 6);
    }

    #[test]
    fn oversized_requests_clamp_to_max() {
        let pool = BufferPool::new(
            BufferPoolOptions::builder()
                .min_size(1024)
                .max_size(65536)
                .build(),
        );
        let buf = pool.get(1 << 22);
        assert_eq!(buf.capacity(), 65536);
    }

    #[test]
    fn connection_patterns_track_a_rounded_mean() {
        let pool = BufferPool::default();
        assert_eq!(pool.optimal_size_for_connection("c1"), None);

        for size in [2000, 3000, 2500] {
            pool.record_connection_pattern("c1", size);
        }
        assert_eq!(pool.optimal_size_for_connection("c1"), Some(4096));

        // Only the last ten observations count.
        for _ in 0..10 {
            pool.record_connection_pattern("c1", 30_000);
        }
        assert_eq!(pool.optimal_size_for_connection("c1"), Some(32_768));
    }

    #[test]
    fn close_disables_pooling() {
        let pool = BufferPool::default();
        let buf = pool.get(1024);
        pool.close();
        pool.put(buf);
        assert_eq!(pool.stats().class_count, 0);

        // Still serves buffers, just unpooled.
        let buf = pool.get(2048);
        assert!(buf.len() >= 2048);
    }
}
