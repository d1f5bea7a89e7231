//! Configuration for connection establishment.

use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::serde_util;

/// Options governing dual-stack resolution and Happy Eyeballs racing.
#[derive(Clone, Debug, TypedBuilder, Deserialize)]
#[builder(field_defaults(default))]
#[serde(default)]
#[non_exhaustive]
pub struct DualStackOptions {
    /// Order IPv6 candidates ahead of IPv4 ones.
    #[builder(default = false)]
    pub prefer_ipv6: bool,

    /// Resolve and dial IPv4 endpoints.
    #[builder(default = true)]
    pub ipv4_enabled: bool,

    /// Resolve and dial IPv6 endpoints.
    #[builder(default = true)]
    pub ipv6_enabled: bool,

    /// How long the first attempt runs alone before the next candidate is
    /// started. Subsequent attempts double this stagger.
    #[builder(default = Duration::from_millis(300))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub happy_eyeballs_delay: Duration,

    /// Combined deadline for the concurrent v4/v6 resolutions.
    #[builder(default = Duration::from_secs(5))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub resolution_timeout: Duration,

    /// Race candidates Happy Eyeballs style. When off, candidates are
    /// dialed sequentially in preference order.
    #[builder(default = true)]
    pub connection_racing: bool,

    /// Cap on simultaneously in-flight dial attempts while racing.
    #[builder(default = 4)]
    pub max_concurrent_dials: usize,
}

impl Default for DualStackOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options governing the retrying dialer.
#[derive(Clone, Debug, TypedBuilder, Deserialize)]
#[builder(field_defaults(default))]
#[serde(default)]
#[non_exhaustive]
pub struct DialerOptions {
    /// Retry attempts after the first, for retryable failures.
    #[builder(default = 3)]
    pub max_retries: u32,

    /// Back-off before the first retry.
    #[builder(default = Duration::from_millis(250))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub initial_retry_delay: Duration,

    /// Ceiling on the back-off between retries.
    #[builder(default = Duration::from_secs(10))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub max_retry_delay: Duration,

    /// Geometric growth factor applied to the back-off after each retry.
    #[builder(default = 2.0)]
    pub retry_multiplier: f64,

    /// Budget for a single dial attempt, covering resolution, racing, and
    /// any TLS handshake.
    #[builder(default = Duration::from_secs(10))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub connection_timeout: Duration,

    /// TCP keepalive idle time applied to established sockets. `None`
    /// leaves keepalive off.
    #[builder(default = Some(crate::runtime::stream::KEEPALIVE_TIME))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis")]
    pub keep_alive: Option<Duration>,

    /// Gate dials through a per-target circuit breaker.
    #[builder(default = true)]
    pub enable_circuit_breaker: bool,

    /// Consecutive failures that open a target's breaker.
    #[builder(default = 5)]
    pub circuit_breaker_threshold: u32,

    /// How long an open breaker denies entry before admitting a probe.
    #[builder(default = Duration::from_secs(30))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub circuit_breaker_timeout: Duration,

    /// Dial both address families. When off, only IPv4 candidates are
    /// considered regardless of `dual_stack.ipv6_enabled`.
    #[builder(default = true)]
    pub dual_stack: bool,

    /// Overrides `dual_stack.happy_eyeballs_delay` when set; kept as a
    /// top-level knob for callers that never touch the nested options.
    #[builder(default = None)]
    #[serde(deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis")]
    pub fallback_delay: Option<Duration>,

    /// Resolution and racing behavior.
    #[builder(default)]
    pub dual_stack_options: DualStackOptions,
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DialerOptions {
    /// The dual-stack options with the dialer-level overrides applied.
    pub(crate) fn effective_dual_stack(&self) -> DualStackOptions {
        let mut options = self.dual_stack_options.clone();
        if !self.dual_stack {
            options.ipv6_enabled = false;
        }
        if let Some(delay) = self.fallback_delay {
            options.happy_eyeballs_delay = delay;
        }
        options
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::DialerOptions;

    #[test]
    fn options_deserialize_with_millisecond_durations() {
        let options: DialerOptions = serde_json::from_str(
            r#"{
                "max_retries": 1,
                "connection_timeout": 2500,
                "keep_alive": null,
                "dual_stack_options": { "prefer_ipv6": true, "happy_eyeballs_delay": 100 }
            }"#,
        )
        .unwrap();
        assert_eq!(options.max_retries, 1);
        assert_eq!(options.connection_timeout, Duration::from_millis(2500));
        assert_eq!(options.keep_alive, None);
        assert!(options.dual_stack_options.prefer_ipv6);
    }

    #[test]
    fn dialer_level_overrides_flow_into_dual_stack() {
        let options = DialerOptions::builder()
            .dual_stack(false)
            .fallback_delay(Some(Duration::from_millis(50)))
            .build();
        let effective = options.effective_dual_stack();
        assert!(!effective.ipv6_enabled);
        assert_eq!(effective.happy_eyeballs_delay, Duration::from_millis(50));
    }
}
