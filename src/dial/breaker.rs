use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

/// The observable state of a [`CircuitBreaker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally; consecutive failures are counted.
    Closed,
    /// Calls are denied until the cool-down elapses.
    Open,
    /// One probe call is admitted to test recovery.
    HalfOpen,
}

/// Per-target failure accounting. After `threshold` consecutive failures
/// the breaker opens for `open_timeout`; the first `allow` after the
/// cool-down admits exactly one probe, whose outcome either closes the
/// breaker or re-opens it with a fresh cool-down.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    open_timeout: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_timeout,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                open_until: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may proceed. In `Open`, flips to `HalfOpen` once the
    /// cool-down has elapsed and admits the caller as the single probe.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let due = state
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if due {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    tracing::debug!("circuit breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful call, closing the breaker from `HalfOpen` and
    /// resetting the consecutive-failure count.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.state != CircuitState::Closed {
            tracing::debug!("circuit breaker closed after successful probe");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.open_until = None;
        state.probe_in_flight = false;
    }

    /// Records a failed call. Opens the breaker from `HalfOpen`, or from
    /// `Closed` once the failure threshold is reached.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.last_failure = Some(now);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.open_until = Some(now + self.open_timeout);
                state.probe_in_flight = false;
                tracing::debug!("circuit breaker re-opened after failed probe");
            }
            CircuitState::Closed if state.consecutive_failures >= self.threshold => {
                state.state = CircuitState::Open;
                state.open_until = Some(now + self.open_timeout);
                tracing::warn!(
                    failures = state.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// The current state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().unwrap().state
    }

    /// How long until the breaker would admit a probe, when it is open.
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Open => state
                .open_until
                .map(|until| until.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }
}
