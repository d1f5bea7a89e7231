//! Configuration for the connection pool.

use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{dial::DialerOptions, serde_util};

/// Options governing a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Clone, Debug, TypedBuilder, Deserialize)]
#[builder(field_defaults(default))]
#[serde(default)]
#[non_exhaustive]
pub struct PoolOptions {
    /// Upper bound on connections per target, counting checked-out ones.
    #[builder(default = 16)]
    pub max_size: usize,

    /// When above zero, maintenance keeps at least this many connections
    /// per known target.
    #[builder(default = 0)]
    pub min_size: usize,

    /// Idle entries older than this are expired. `None` disables idle
    /// expiry.
    #[builder(default = Some(Duration::from_secs(300)))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis")]
    pub max_idle_time: Option<Duration>,

    /// Entries older than this are expired regardless of use. `None`
    /// disables lifetime expiry.
    #[builder(default = Some(Duration::from_secs(3600)))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis")]
    pub max_lifetime: Option<Duration>,

    /// Cadence of the background maintenance sweep.
    #[builder(default = Duration::from_secs(30))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub health_check_interval: Duration,

    /// Budget for dialing a connection on a pool miss.
    #[builder(default = Duration::from_secs(10))]
    #[serde(deserialize_with = "serde_util::deserialize_duration_from_u64_millis")]
    pub connection_timeout: Duration,

    /// Run the background maintenance worker. Disabling leaves expiry to
    /// the get/put paths.
    #[builder(default = true)]
    pub enable_health_check: bool,

    /// Options for the dialer the pool uses on misses.
    #[builder(default)]
    pub dialer: DialerOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}
