//! Named health probes with periodic execution and worst-of aggregation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, Weak},
    time::{Duration, SystemTime},
};

use derive_where::derive_where;
use futures_util::{future::BoxFuture, FutureExt};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::runtime;

/// Default per-probe execution budget.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cadence for monitored probes.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Status reported by a probe. Aggregation takes the worst of its parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Operating with reduced capacity or elevated errors.
    Degraded,
    /// Not operational.
    Unhealthy,
    /// No result yet, or the probe couldn't determine a status.
    Unknown,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Unhealthy => 3,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        };
        write!(fmt, "{}", s)
    }
}

/// The outcome of one probe execution.
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct HealthResult {
    /// The probe's registered name.
    pub name: String,
    /// The reported status.
    pub status: HealthStatus,
    /// Human-readable detail.
    pub message: String,
    /// Error text when the probe failed, timed out, or panicked.
    pub error: Option<String>,
    /// How long the probe took.
    pub duration: Duration,
    /// When the probe finished.
    pub timestamp: SystemTime,
    /// Free-form metadata attached by the probe.
    pub metadata: HashMap<String, String>,
}

impl HealthResult {
    /// Creates a result with the current timestamp and no metadata.
    pub fn new(
        name: impl Into<String>,
        status: HealthStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            error: None,
            duration: Duration::ZERO,
            timestamp: SystemTime::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attaches error text.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attaches one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A health probe. Implementations should be cheap to call; the manager
/// applies the registered timeout and recovers panics.
pub trait HealthChecker: Send + Sync + 'static {
    /// Runs the probe once.
    fn check(&self) -> BoxFuture<'_, HealthResult>;
}

struct FnChecker<F> {
    func: F,
}

impl<F, Fut> HealthChecker for FnChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HealthResult> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, HealthResult> {
        (self.func)().boxed()
    }
}

/// Worst-of roll-up across all registered probes, from
/// [`HealthManager::aggregated_health`].
#[derive(Clone, Debug, Serialize)]
#[non_exhaustive]
pub struct AggregatedHealth {
    /// The worst status among the parts.
    pub status: HealthStatus,
    /// Latest result per probe; probes that never ran report `Unknown`.
    pub results: HashMap<String, HealthResult>,
    /// Number of probes per status.
    pub counts: HashMap<HealthStatus, usize>,
    /// Total registered probes.
    pub total: usize,
}

type StatusCallback = Arc<dyn Fn(&str, HealthStatus, HealthStatus) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    checker: Arc<dyn HealthChecker>,
    timeout: Duration,
    interval: Duration,
}

#[derive_where(Debug)]
struct HealthManagerInner {
    #[derive_where(skip)]
    registry: RwLock<HashMap<String, Registration>>,
    #[derive_where(skip)]
    results: RwLock<HashMap<String, HealthResult>>,
    #[derive_where(skip)]
    callbacks: RwLock<Vec<StatusCallback>>,
    monitor_token: Mutex<Option<CancellationToken>>,
}

/// A registry of named health probes.
///
/// Explicitly constructed and passed where needed; the crate deliberately
/// ships no process-wide instance. Cloning is cheap and clones share the
/// registry.
#[derive(Clone, Debug, Default)]
pub struct HealthManager {
    inner: Arc<HealthManagerInner>,
}

impl Default for HealthManagerInner {
    fn default() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            monitor_token: Mutex::new(None),
        }
    }
}

impl HealthManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a probe under `name`, replacing any previous registration
    /// with that name. When monitoring is running the probe is scheduled
    /// immediately.
    pub fn register_checker(
        &self,
        name: impl Into<String>,
        checker: Arc<dyn HealthChecker>,
        timeout: Duration,
        interval: Duration,
    ) {
        let name = name.into();
        let previous = self.inner.registry.write().unwrap().insert(
            name.clone(),
            Registration {
                checker,
                timeout,
                interval,
            },
        );

        // A replaced registration already has a monitor loop; it picks up
        // the new checker on its next cycle.
        if previous.is_none() {
            let token = self.inner.monitor_token.lock().unwrap().clone();
            if let Some(token) = token {
                spawn_probe_loop(Arc::downgrade(&self.inner), name, token);
            }
        }
    }

    /// Registers a closure-backed probe with default timeout and interval.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HealthResult> + Send + 'static,
    {
        self.register_checker(
            name,
            Arc::new(FnChecker { func }),
            DEFAULT_CHECK_TIMEOUT,
            DEFAULT_CHECK_INTERVAL,
        );
    }

    /// Removes a probe and its cached result. Its monitor loop, if any,
    /// exits on its next cycle.
    pub fn unregister_checker(&self, name: &str) {
        self.inner.registry.write().unwrap().remove(name);
        self.inner.results.write().unwrap().remove(name);
    }

    /// Runs one probe now, caching and returning its result. Returns
    /// `None` when no probe is registered under `name`.
    pub async fn check_one(&self, name: &str) -> Option<HealthResult> {
        let registration = self.inner.registry.read().unwrap().get(name).cloned()?;
        Some(run_probe(&self.inner, name.to_string(), registration).await)
    }

    /// Runs every registered probe concurrently, each under its own
    /// timeout, and returns the fresh results.
    pub async fn check_all(&self) -> HashMap<String, HealthResult> {
        let registrations: Vec<(String, Registration)> = {
            let registry = self.inner.registry.read().unwrap();
            registry
                .iter()
                .map(|(name, registration)| (name.clone(), registration.clone()))
                .collect()
        };

        let checks = registrations
            .into_iter()
            .map(|(name, registration)| run_probe(&self.inner, name, registration));
        futures_util::future::join_all(checks)
            .await
            .into_iter()
            .map(|result| (result.name.clone(), result))
            .collect()
    }

    /// The worst-of-parts roll-up over the latest cached results.
    pub fn aggregated_health(&self) -> AggregatedHealth {
        let registry = self.inner.registry.read().unwrap();
        let results = self.inner.results.read().unwrap();

        let mut out = HashMap::new();
        let mut counts: HashMap<HealthStatus, usize> = HashMap::new();
        let mut worst = HealthStatus::Healthy;
        for name in registry.keys() {
            let result = results.get(name).cloned().unwrap_or_else(|| {
                HealthResult::new(name.clone(), HealthStatus::Unknown, "not yet checked")
            });
            if result.status.severity() > worst.severity() {
                worst = result.status;
            }
            *counts.entry(result.status).or_insert(0) += 1;
            out.insert(name.clone(), result);
        }

        AggregatedHealth {
            status: worst,
            total: out.len(),
            results: out,
            counts,
        }
    }

    /// Registers a callback fired (asynchronously) whenever a probe's
    /// status changes. Arguments: probe name, previous status, new status.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&str, HealthStatus, HealthStatus) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().unwrap().push(Arc::new(callback));
    }

    /// Starts a monitor loop per registered probe, each on its own
    /// interval. No-op if monitoring is already running.
    pub fn start_monitoring(&self) {
        let mut guard = self.inner.monitor_token.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        let names: Vec<String> = {
            let registry = self.inner.registry.read().unwrap();
            registry.keys().cloned().collect()
        };
        for name in names {
            spawn_probe_loop(Arc::downgrade(&self.inner), name, token.clone());
        }
        tracing::debug!("health monitoring started");
    }

    /// Stops all monitor loops. Idempotent.
    pub fn stop_monitoring(&self) {
        if let Some(token) = self.inner.monitor_token.lock().unwrap().take() {
            token.cancel();
            tracing::debug!("health monitoring stopped");
        }
    }
}

/// Runs a probe under its timeout with panic recovery, stores the result,
/// and fires status-change callbacks.
async fn run_probe(
    inner: &Arc<HealthManagerInner>,
    name: String,
    registration: Registration,
) -> HealthResult {
    let started = Instant::now();
    let guarded = std::panic::AssertUnwindSafe(registration.checker.check()).catch_unwind();

    let mut result = match tokio::time::timeout(registration.timeout, guarded).await {
        Err(_) => HealthResult::new(
            name.clone(),
            HealthStatus::Unhealthy,
            "health check timed out",
        )
        .with_error(format!("no result within {:?}", registration.timeout)),
        Ok(Err(panic)) => {
            let message = runtime::panic_message(panic.as_ref());
            HealthResult::new(
                name.clone(),
                HealthStatus::Unhealthy,
                format!("health check panicked: {}", message),
            )
            .with_error(message)
        }
        Ok(Ok(result)) => result,
    };
    result.name = name.clone();
    result.duration = started.elapsed();
    result.timestamp = SystemTime::now();

    let previous = {
        let mut results = inner.results.write().unwrap();
        results.insert(name.clone(), result.clone()).map(|r| r.status)
    };

    let changed = previous != Some(result.status);
    if changed {
        let old = previous.unwrap_or(HealthStatus::Unknown);
        let new = result.status;
        tracing::debug!(probe = %name, %old, %new, "health status changed");
        let callbacks: Vec<StatusCallback> = inner.callbacks.read().unwrap().clone();
        if !callbacks.is_empty() {
            let name = name.clone();
            runtime::spawn(async move {
                for callback in callbacks {
                    callback(&name, old, new);
                }
            });
        }
    }

    result
}

/// One monitor loop: runs its probe at the registered interval until the
/// token fires, the probe is unregistered, or the manager is dropped.
fn spawn_probe_loop(inner: Weak<HealthManagerInner>, name: String, token: CancellationToken) {
    runtime::spawn(async move {
        loop {
            let interval = {
                let Some(inner) = inner.upgrade() else { return };
                let Some(registration) =
                    inner.registry.read().unwrap().get(&name).cloned()
                else {
                    return;
                };
                let interval = registration.interval;
                run_probe(&inner, name.clone(), registration).await;
                interval
            };

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
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

    use super::{HealthManager, HealthResult, HealthStatus};

    #[tokio::test]
    async fn aggregation_takes_the_worst_status() {
        let manager = HealthManager::new();
        manager.register_fn("ok", || async {
            HealthResult::new("ok", HealthStatus::Healthy, "fine")
        });
        manager.register_fn("meh", || async {
            HealthResult::new("meh", HealthStatus::Degraded, "slow")
        });

        manager.check_all().await;
        let aggregated = manager.aggregated_health();
        assert_eq!(aggregated.status, HealthStatus::Degraded);
        assert_eq!(aggregated.total, 2);
        assert_eq!(aggregated.counts[&HealthStatus::Healthy], 1);

        manager.register_fn("bad", || async {
            HealthResult::new("bad", HealthStatus::Unhealthy, "down")
        });
        manager.check_all().await;
        assert_eq!(
            manager.aggregated_health().status,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn unchecked_probes_report_unknown() {
        let manager = HealthManager::new();
        manager.register_fn("quiet", || async {
            HealthResult::new("quiet", HealthStatus::Healthy, "fine")
        });

        let aggregated = manager.aggregated_health();
        assert_eq!(aggregated.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn panicking_probes_become_unhealthy() {
        let manager = HealthManager::new();
        manager.register_fn("explosive", || async {
            panic!("probe exploded");
        });

        let result = manager.check_one("explosive").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.as_deref().unwrap().contains("probe exploded"));
    }

    #[tokio::test]
    async fn slow_probes_time_out_unhealthy() {
        let manager = HealthManager::new();
        manager.register_checker(
            "sluggish",
            Arc::new(super::FnChecker {
                func: || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    HealthResult::new("sluggish", HealthStatus::Healthy, "eventually")
                },
            }),
            Duration::from_millis(50),
            Duration::from_secs(30),
        );

        let result = manager.check_one("sluggish").await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn callbacks_fire_on_status_change() {
        let manager = HealthManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            manager.register_callback(move |_, _, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        {
            let healthy = healthy.clone();
            manager.register_fn("flappy", move || {
                let healthy = healthy.clone();
                async move {
                    if healthy.load(Ordering::SeqCst) {
                        HealthResult::new("flappy", HealthStatus::Healthy, "up")
                    } else {
                        HealthResult::new("flappy", HealthStatus::Unhealthy, "down")
                    }
                }
            });
        }

        manager.check_all().await;
        healthy.store(false, Ordering::SeqCst);
        manager.check_all().await;
        manager.check_all().await;

        // Give the async callback dispatch a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        // None -> Healthy -> Unhealthy are changes; the repeat is not.
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn monitoring_runs_probes_periodically() {
        let manager = HealthManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            manager.register_checker(
                "ticker",
                Arc::new(super::FnChecker {
                    func: move || {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            HealthResult::new("ticker", HealthStatus::Healthy, "tick")
                        }
                    },
                }),
                Duration::from_millis(100),
                Duration::from_millis(20),
            );
        }

        manager.start_monitoring();
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.stop_monitoring();
        manager.stop_monitoring();

        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 3, "expected several runs, got {}", after_stop);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }
}
