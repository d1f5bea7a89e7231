//! Hardened connection establishment: validation, per-target circuit
//! breaking, Happy Eyeballs racing, and retry with exponential back-off.

mod breaker;
mod happy_eyeballs;
mod options;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

pub use self::{
    breaker::{CircuitBreaker, CircuitState},
    options::{DialerOptions, DualStackOptions},
};
use self::happy_eyeballs::DualStackDialer;
#[cfg(feature = "rustls-tls")]
use crate::runtime::tls::{self, TlsOptions};
use crate::{
    conn::ManagedConnection,
    error::{Error, ErrorKind, Result},
    event::{self, MetricsSink},
    options::Address,
    runtime::stream::AsyncStream,
};

enum Security {
    None,
    #[cfg(feature = "rustls-tls")]
    Tls(TlsOptions),
}

impl Security {
    fn protocol(&self) -> &'static str {
        match self {
            Self::None => "tcp",
            #[cfg(feature = "rustls-tls")]
            Self::Tls(_) => "tls",
        }
    }
}

/// Establishes [`ManagedConnection`]s, absorbing transient failures via
/// retry and isolating persistently failing targets via per-target circuit
/// breakers. Cloning is cheap; clones share breakers and configuration.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<DialerInner>,
}

struct DialerInner {
    options: DialerOptions,
    dual_stack: DualStackDialer,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: RwLock<Option<Arc<dyn MetricsSink>>>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(DialerOptions::default())
    }
}

impl Dialer {
    pub fn new(options: DialerOptions) -> Self {
        let dual_stack =
            DualStackDialer::new(options.effective_dual_stack(), options.keep_alive);
        Self {
            inner: Arc::new(DialerInner {
                options,
                dual_stack,
                breakers: RwLock::new(HashMap::new()),
                metrics: RwLock::new(None),
            }),
        }
    }

    /// Attaches a metrics sink; it is also propagated to the connections
    /// this dialer establishes.
    pub fn set_metrics(&self, sink: Arc<dyn MetricsSink>) {
        *self.inner.metrics.write().unwrap() = Some(sink);
    }

    /// Dials `target` (`"host:port"`), returning an established
    /// connection.
    pub async fn dial(&self, target: impl AsRef<str>) -> Result<ManagedConnection> {
        self.dial_inner(target.as_ref(), Security::None).await
    }

    /// Dials `target` and performs a TLS handshake with the supplied
    /// configuration. Handshake failures close the socket and are not
    /// retried.
    #[cfg(feature = "rustls-tls")]
    pub async fn dial_tls(
        &self,
        target: impl AsRef<str>,
        tls_options: TlsOptions,
    ) -> Result<ManagedConnection> {
        self.dial_inner(target.as_ref(), Security::Tls(tls_options))
            .await
    }

    /// The breaker state for a target, when one exists.
    pub fn breaker_state(&self, target: &str) -> Option<CircuitState> {
        let breakers = self.inner.breakers.read().unwrap();
        breakers.get(target).map(|b| b.state())
    }

    async fn dial_inner(&self, target: &str, security: Security) -> Result<ManagedConnection> {
        let address = Address::parse(target)?;

        let breaker = self.breaker_for(&address);
        if let Some(ref breaker) = breaker {
            if !breaker.allow() {
                return Err(ErrorKind::CircuitOpen {
                    target: address.to_string(),
                    retry_after: breaker.retry_after(),
                }
                .into());
            }
        }

        let mut delay = self.inner.options.initial_retry_delay;
        let mut retries = 0u32;
        loop {
            match self.attempt(&address, &security).await {
                Ok(stream) => {
                    if let Some(ref breaker) = breaker {
                        breaker.record_success();
                    }
                    self.emit_attempt(&address, true);
                    let sink = self.inner.metrics.read().unwrap().clone();
                    return Ok(ManagedConnection::establish(
                        stream,
                        address,
                        security.protocol(),
                        sink,
                    ));
                }
                Err(e) => {
                    self.emit_attempt(&address, false);
                    if e.is_retryable() && retries < self.inner.options.max_retries {
                        retries += 1;
                        tracing::debug!(
                            address = %address,
                            retry = retries,
                            backoff = ?delay,
                            error = %e,
                            "dial attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay = next_delay(
                            delay,
                            self.inner.options.retry_multiplier,
                            self.inner.options.max_retry_delay,
                        );
                        continue;
                    }

                    if let Some(ref breaker) = breaker {
                        breaker.record_failure();
                    }
                    tracing::warn!(address = %address, error = %e, "dial failed");
                    return Err(e.with_context("target", address.to_string()));
                }
            }
        }
    }

    /// One timeout-bounded attempt: socket race plus, when requested, the
    /// TLS handshake.
    async fn attempt(&self, address: &Address, security: &Security) -> Result<AsyncStream> {
        let connect = async {
            let tcp = self.inner.dual_stack.connect(address).await?;
            match security {
                Security::None => Ok(AsyncStream::Tcp(tcp)),
                #[cfg(feature = "rustls-tls")]
                Security::Tls(tls_options) => {
                    let session = tls::tls_connect(&address.host, tls_options, tcp).await?;
                    Ok(AsyncStream::from(session))
                }
            }
        };

        tokio::time::timeout(self.inner.options.connection_timeout, connect)
            .await
            .unwrap_or_else(|elapsed| Err(Error::from(elapsed)))
    }

    fn breaker_for(&self, address: &Address) -> Option<Arc<CircuitBreaker>> {
        if !self.inner.options.enable_circuit_breaker {
            return None;
        }
        let key = address.to_string();

        {
            let breakers = self.inner.breakers.read().unwrap();
            if let Some(breaker) = breakers.get(&key) {
                return Some(breaker.clone());
            }
        }

        let mut breakers = self.inner.breakers.write().unwrap();
        Some(
            breakers
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(
                        self.inner.options.circuit_breaker_threshold,
                        self.inner.options.circuit_breaker_timeout,
                    ))
                })
                .clone(),
        )
    }

    fn emit_attempt(&self, address: &Address, success: bool) {
        let sink = self.inner.metrics.read().unwrap().clone();
        if let Some(sink) = sink {
            sink.increment_counter(
                event::DIAL_ATTEMPTS,
                &[
                    ("address", address.to_string()),
                    ("success", success.to_string()),
                ],
            );
        }
    }
}

fn next_delay(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let grown = current.as_secs_f64() * multiplier.max(1.0);
    Duration::from_secs_f64(grown.min(max.as_secs_f64()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::{CircuitState, Dialer, DialerOptions};
    use crate::conn::ConnectionState;

    fn no_retry_options() -> DialerOptions {
        DialerOptions::builder()
            .max_retries(0)
            .circuit_breaker_threshold(2)
            .circuit_breaker_timeout(Duration::from_millis(200))
            .build()
    }

    #[tokio::test]
    async fn dials_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let conn = Dialer::default().dial(&target).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.protocol(), "tcp");
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn rejects_invalid_targets_before_any_io() {
        let dialer = Dialer::default();
        for target in ["", "nohost", "host:0", "host;evil:80", "host:abc"] {
            let err = dialer.dial(target).await.unwrap_err();
            assert_eq!(err.code(), "validation", "target {:?}", target);
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        // Find a dead port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let dialer = Dialer::new(no_retry_options());
        for _ in 0..2 {
            let err = dialer.dial(&target).await.unwrap_err();
            assert_eq!(err.code(), "network.refused");
        }
        assert_eq!(dialer.breaker_state(&target), Some(CircuitState::Open));

        let err = dialer.dial(&target).await.unwrap_err();
        assert_eq!(err.code(), "breaker.open");
    }

    #[tokio::test]
    async fn breaker_closes_after_successful_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let target = format!("127.0.0.1:{}", addr.port());
        drop(listener);

        let dialer = Dialer::new(no_retry_options());
        for _ in 0..2 {
            dialer.dial(&target).await.unwrap_err();
        }
        assert_eq!(dialer.breaker_state(&target), Some(CircuitState::Open));

        // Bring the target back and wait out the cool-down.
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let conn = dialer.dial(&target).await.unwrap();
        assert_eq!(dialer.breaker_state(&target), Some(CircuitState::Closed));
        conn.close().await.unwrap();
        drop(listener);
    }

    #[tokio::test]
    async fn retries_until_a_listener_appears() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let target = format!("127.0.0.1:{}", addr.port());
        drop(listener);

        let options = DialerOptions::builder()
            .max_retries(5)
            .initial_retry_delay(Duration::from_millis(50))
            .enable_circuit_breaker(false)
            .build();

        let rebind = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            TcpListener::bind(addr).await.unwrap()
        });

        let conn = Dialer::new(options).dial(&target).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        drop(rebind.await.unwrap());
    }
}
