//! An elastic worker pool executing cancellable, priority-ordered tasks.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, ErrorKind, Result},
    runtime, serde_util,
};

/// How long an idle worker sleeps before rechecking the queue when no
/// wake-up arrives.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Grow when active workers reach this share of the worker count.
const SCALE_UP_UTILIZATION: f64 = 0.75;

/// Idle workers beyond this low-water mark, sustained for two scale
/// cycles, retire one worker.
const IDLE_LOW_WATER: usize = 1;

type TaskFuture = BoxFuture<'static, Result<()>>;
type TaskFn = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send>;
type CompletionFn = Box<dyn FnOnce(Result<()>) + Send>;

/// Options governing a [`WorkerPool`].
#[derive(Clone, Debug, TypedBuilder, serde::Deserialize)]
#[builder(field_defaults(default))]
#[serde(default)]
#[non_exhaustive]
pub struct WorkerPoolOptions {
    /// Workers kept alive even when idle.
    #[builder(default = 1)]
    pub min_workers: usize,

    /// Upper bound on concurrent workers.
    #[builder(default = 8)]
    pub max_workers: usize,

    /// Cadence of the scaling loop.
    #[builder(default = Duration::from_secs(1))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub scale_interval: Duration,

    /// Bound on queued tasks; `submit` waits for room when the queue is
    /// full.
    #[builder(default = 256)]
    pub queue_capacity: usize,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A unit of work: an id for logging, a priority (higher runs first), an
/// optional timeout, and the function itself. The function receives a
/// cancellation token that fires if the task times out or the pool is
/// force-shut-down.
pub struct Task {
    id: String,
    priority: i32,
    timeout: Option<Duration>,
    func: TaskFn,
    callback: Option<CompletionFn>,
}

impl Task {
    /// Creates a task with priority 0 and no timeout.
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority: 0,
            timeout: None,
            func: Box::new(move |token| func(token).boxed()),
            callback: None,
        }
    }

    /// Higher priorities are dispatched first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Bounds the task's execution; on expiry its token fires and the
    /// task counts as failed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs `callback` with the task's outcome once it completes, fails,
    /// times out, or panics.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

struct QueuedTask {
    task: Task,
    seq: u64,
    submitted_at: Instant,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO by sequence.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Counters describing pool activity, from [`WorkerPool::stats`].
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct WorkerPoolStats {
    /// Tasks accepted by `submit`.
    pub total_tasks: u64,
    /// Tasks that ran to successful completion.
    pub completed_tasks: u64,
    /// Tasks that errored, panicked, or timed out.
    pub failed_tasks: u64,
    /// Workers currently executing a task.
    pub active_workers: usize,
    /// Live workers right now.
    pub current_workers: usize,
    /// Highest worker count ever reached.
    pub peak_workers: usize,
    /// Workers spawned over the pool's lifetime.
    pub worker_creations: u64,
    /// Tasks waiting in the queue.
    pub queued_tasks: usize,
}

struct PoolShared {
    options: WorkerPoolOptions,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    /// Wakes idle workers when work arrives or shutdown begins.
    work_notify: Notify,
    /// Wakes blocked submitters when queue room frees up.
    capacity_notify: Notify,
    next_seq: AtomicU64,
    total_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    active_workers: AtomicUsize,
    worker_count: AtomicUsize,
    peak_workers: AtomicUsize,
    worker_creations: AtomicU64,
    /// Workers retire down to this count when idle.
    target_workers: AtomicUsize,
    /// Intake closed; workers drain and exit.
    shutdown: AtomicBool,
    /// Fires on force-shutdown; parent of every task token.
    root_token: CancellationToken,
}

/// An elastically sized executor for cancellable, priority-ordered tasks.
///
/// Cloning is cheap; clones share the pool. When every clone is dropped
/// the workers wind down on their own.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    /// Never sends; every clone of the pool holds one, and the watchdog's
    /// receiver learning that all senders dropped is what winds the
    /// workers down.
    _alive: mpsc::Sender<()>,
}

impl WorkerPool {
    /// Creates a pool with `min_workers` running and the scaling loop
    /// started.
    pub fn new(options: WorkerPoolOptions) -> Self {
        let min_workers = options.min_workers.max(1);
        let max_workers = options.max_workers.max(min_workers);

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            work_notify: Notify::new(),
            capacity_notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            total_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            worker_count: AtomicUsize::new(0),
            peak_workers: AtomicUsize::new(0),
            worker_creations: AtomicU64::new(0),
            target_workers: AtomicUsize::new(min_workers),
            shutdown: AtomicBool::new(false),
            root_token: CancellationToken::new(),
            options: WorkerPoolOptions {
                min_workers,
                max_workers,
                ..options
            },
        });

        for _ in 0..min_workers {
            spawn_worker(&shared);
        }

        let (alive, dropped_rx) = mpsc::channel(1);
        spawn_watchdog(&shared, dropped_rx);
        spawn_scaler(&shared);

        Self {
            shared,
            _alive: alive,
        }
    }

    /// Enqueues a task, waiting for queue room when the pool is at
    /// capacity. Fails with `resource.closed` after shutdown.
    pub async fn submit(&self, task: Task) -> Result<()> {
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(Error::resource_closed("worker pool"));
            }
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if queue.len() < self.shared.options.queue_capacity {
                    let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
                    queue.push(QueuedTask {
                        task,
                        seq,
                        submitted_at: Instant::now(),
                    });
                    break;
                }
            }
            tokio::select! {
                _ = self.shared.capacity_notify.notified() => {}
                _ = self.shared.root_token.cancelled() => {
                    return Err(Error::resource_closed("worker pool"));
                }
            }
        }

        self.shared.total_tasks.fetch_add(1, Ordering::Relaxed);
        self.shared.work_notify.notify_one();
        Ok(())
    }

    /// Convenience wrapper: submits `func` as a task with default
    /// priority and no timeout.
    pub async fn submit_fn<F, Fut>(&self, id: impl Into<String>, func: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.submit(Task::new(id, func)).await
    }

    /// Stops intake and waits up to `timeout` for queued and in-flight
    /// tasks to finish, then stops the workers. Returns a timeout error
    /// if work remained; remaining tasks are cancelled.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_notify.notify_waiters();

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let queued = self.shared.queue.lock().unwrap().len();
                let active = self.shared.active_workers.load(Ordering::Acquire);
                if queued == 0 && active == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        self.shared.root_token.cancel();
        self.shared.work_notify.notify_waiters();
        drained.map_err(|_| {
            Error::network_timeout().with_context("operation", "worker pool shutdown")
        })
    }

    /// Cancels everything immediately: queued tasks are dropped and
    /// in-flight task tokens fire.
    pub fn force_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.root_token.cancel();
        self.shared.queue.lock().unwrap().clear();
        self.shared.work_notify.notify_waiters();
        self.shared.capacity_notify.notify_waiters();
    }

    /// A snapshot of the pool's counters.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            total_tasks: self.shared.total_tasks.load(Ordering::Relaxed),
            completed_tasks: self.shared.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.shared.failed_tasks.load(Ordering::Relaxed),
            active_workers: self.shared.active_workers.load(Ordering::Relaxed),
            current_workers: self.shared.worker_count.load(Ordering::Relaxed),
            peak_workers: self.shared.peak_workers.load(Ordering::Relaxed),
            worker_creations: self.shared.worker_creations.load(Ordering::Relaxed),
            queued_tasks: self.shared.queue.lock().unwrap().len(),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(WorkerPoolOptions::default())
    }
}

fn spawn_worker(shared: &Arc<PoolShared>) {
    let count = shared.worker_count.fetch_add(1, Ordering::AcqRel) + 1;
    shared.worker_creations.fetch_add(1, Ordering::Relaxed);
    shared.peak_workers.fetch_max(count, Ordering::AcqRel);

    let shared = shared.clone();
    runtime::spawn(async move {
        worker_loop(&shared).await;
        shared.worker_count.fetch_sub(1, Ordering::AcqRel);
    });
}

async fn worker_loop(shared: &Arc<PoolShared>) {
    loop {
        if shared.root_token.is_cancelled() {
            return;
        }

        let task = { shared.queue.lock().unwrap().pop() };
        match task {
            Some(queued) => {
                shared.capacity_notify.notify_one();
                execute(shared, queued).await;
            }
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                // Retire only while idle, and only down to the target.
                let count = shared.worker_count.load(Ordering::Acquire);
                if count > shared.target_workers.load(Ordering::Acquire)
                    && count > shared.options.min_workers
                {
                    return;
                }
                tokio::select! {
                    _ = shared.work_notify.notified() => {}
                    _ = shared.root_token.cancelled() => return,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
}

async fn execute(shared: &Arc<PoolShared>, queued: QueuedTask) {
    shared.active_workers.fetch_add(1, Ordering::AcqRel);

    let QueuedTask {
        task, submitted_at, ..
    } = queued;
    let token = shared.root_token.child_token();
    let started = Instant::now();
    tracing::debug!(
        id = %task.id,
        priority = task.priority,
        queued_for = ?submitted_at.elapsed(),
        "task started"
    );

    let future = std::panic::AssertUnwindSafe((task.func)(token.clone())).catch_unwind();
    let outcome = match task.timeout {
        Some(timeout) => tokio::time::timeout(timeout, future).await,
        None => Ok(future.await),
    };

    let result: Result<()> = match outcome {
        Err(_elapsed) => {
            token.cancel();
            tracing::warn!(id = %task.id, timeout = ?task.timeout, "task timed out");
            Err(Error::network_timeout().with_context("task_id", task.id.clone()))
        }
        Ok(Err(panic)) => {
            let message = runtime::panic_message(panic.as_ref());
            tracing::error!(id = %task.id, panic = %message, "task panicked");
            Err(ErrorKind::Panic { message }.into())
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(id = %task.id, error = %e, "task failed");
            Err(e)
        }
        Ok(Ok(Ok(()))) => {
            tracing::debug!(id = %task.id, ran_for = ?started.elapsed(), "task completed");
            Ok(())
        }
    };

    if result.is_ok() {
        shared.completed_tasks.fetch_add(1, Ordering::Relaxed);
    } else {
        shared.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }
    if let Some(callback) = task.callback {
        callback(result);
    }

    shared.active_workers.fetch_sub(1, Ordering::AcqRel);
}

/// The scaling loop: grows the pool by one when there is backlog or high
/// utilization, and retires one worker after two consecutive idle cycles.
fn spawn_scaler(shared: &Arc<PoolShared>) {
    let weak = Arc::downgrade(shared);
    let token = shared.root_token.clone();
    let interval = shared.options.scale_interval;
    runtime::spawn(async move {
        let mut idle_cycles = 0u32;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(shared) = weak.upgrade() else { return };
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }

            let queued = shared.queue.lock().unwrap().len();
            let active = shared.active_workers.load(Ordering::Acquire);
            let count = shared.worker_count.load(Ordering::Acquire).max(1);

            let busy = queued > 0 || (active as f64) >= (count as f64) * SCALE_UP_UTILIZATION;
            if busy {
                idle_cycles = 0;
                if count < shared.options.max_workers {
                    shared.target_workers.store(count + 1, Ordering::Release);
                    spawn_worker(&shared);
                    tracing::debug!(workers = count + 1, queued, active, "worker pool grew");
                }
                continue;
            }

            let idle = count.saturating_sub(active);
            if idle > IDLE_LOW_WATER && count > shared.options.min_workers {
                idle_cycles += 1;
                if idle_cycles >= 2 {
                    idle_cycles = 0;
                    shared.target_workers.store(count - 1, Ordering::Release);
                    // Nudge an idle worker so it notices the new target.
                    shared.work_notify.notify_one();
                    tracing::debug!(workers = count - 1, "worker pool shrank");
                }
            } else {
                idle_cycles = 0;
            }
        }
    });
}

/// Winds the pool down once every `WorkerPool` clone is gone. Nothing is
/// ever sent on the channel; `recv` returning `None` is the signal that
/// the last `_alive` sender dropped.
fn spawn_watchdog(shared: &Arc<PoolShared>, mut dropped_rx: mpsc::Receiver<()>) {
    let weak = Arc::downgrade(shared);
    runtime::spawn(async move {
        dropped_rx.recv().await;
        if let Some(shared) = weak.upgrade() {
            shared.shutdown.store(true, Ordering::Release);
            shared.root_token.cancel();
            shared.work_notify.notify_waiters();
        }
    });
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::time::Instant;

    use super::{Task, WorkerPool, WorkerPoolOptions};

    fn pool(max_workers: usize) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolOptions::builder()
                .min_workers(1)
                .max_workers(max_workers)
                .scale_interval(Duration::from_millis(50))
                .build(),
        )
    }

    #[tokio::test]
    async fn tasks_run_and_are_counted() {
        let pool = pool(4);
        let ran = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let ran = ran.clone();
            pool.submit_fn(format!("task-{}", i), move |_token| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 5);

        let stats = pool.stats();
        assert_eq!(stats.total_tasks, 5);
        assert_eq!(stats.completed_tasks, 5);
        assert_eq!(stats.failed_tasks, 0);
    }

    #[tokio::test]
    async fn priority_orders_dispatch() {
        // One worker, and a blocker task so the queue builds up.
        let pool = pool(1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        pool.submit(Task::new("blocker", move |_| async move {
            let _ = release_rx.await;
            Ok(())
        }))
        .await
        .unwrap();

        for (id, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            let order = order.clone();
            pool.submit(
                Task::new(id, move |_| async move {
                    order.lock().unwrap().push(id);
                    Ok(())
                })
                .with_priority(priority),
            )
            .await
            .unwrap();
        }

        release_tx.send(()).unwrap();
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn timed_out_tasks_fail_and_observe_cancellation() {
        let pool = pool(2);
        let (token_tx, token_rx) = tokio::sync::oneshot::channel();

        let submitted = Instant::now();
        pool.submit(
            Task::new("sleepy", move |token| async move {
                let _ = token_tx.send(token.clone());
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        let token = token_rx.await.unwrap();
        token.cancelled().await;
        let fired_after = submitted.elapsed();
        assert!(fired_after >= Duration::from_millis(45), "{:?}", fired_after);
        assert!(fired_after < Duration::from_millis(150), "{:?}", fired_after);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().failed_tasks, 1);
        pool.force_shutdown();
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let pool = pool(2);
        pool.submit_fn("boom", |_| async { panic!("kaboom") })
            .await
            .unwrap();
        pool.submit_fn("fine", |_| async { Ok(()) }).await.unwrap();

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
    }

    #[tokio::test]
    async fn pool_scales_up_under_backlog() {
        let pool = pool(4);
        for i in 0..8 {
            pool.submit_fn(format!("slow-{}", i), |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pool.stats().peak_workers > 1);
        pool.force_shutdown();
    }

    #[tokio::test]
    async fn completion_callbacks_receive_the_outcome() {
        let pool = pool(2);
        let (ok_tx, ok_rx) = tokio::sync::oneshot::channel();
        let (err_tx, err_rx) = tokio::sync::oneshot::channel();

        pool.submit(
            Task::new("succeeds", |_| async { Ok(()) })
                .with_callback(move |result| {
                    let _ = ok_tx.send(result.is_ok());
                }),
        )
        .await
        .unwrap();

        pool.submit(
            Task::new("slow", |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .with_timeout(Duration::from_millis(30))
            .with_callback(move |result| {
                let _ = err_tx.send(result.unwrap_err().code());
            }),
        )
        .await
        .unwrap();

        assert!(ok_rx.await.unwrap());
        assert_eq!(err_rx.await.unwrap(), "network.timeout");
        pool.force_shutdown();
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let pool = pool(2);
        pool.shutdown(Duration::from_secs(1)).await.unwrap();

        let err = pool
            .submit_fn("late", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "resource.closed");
    }
}
