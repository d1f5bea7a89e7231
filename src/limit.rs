//! Rate limiting: the token bucket primitive, human-friendly rate strings,
//! and a sliding-window limiter keyed by identifier.

mod bucket;

use std::{
    collections::{HashMap, VecDeque},
    str::FromStr,
    sync::{Mutex, RwLock},
    time::Duration,
};

use tokio::time::Instant;

pub use self::bucket::TokenBucket;
use crate::error::{Error, Result};

/// A parsed byte rate such as `"1MB/s"`. Units are powers of 1024 and
/// case-insensitive; the burst is a tenth of the rate with a 1024-byte
/// floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRate {
    /// Sustained bytes per second.
    pub bytes_per_sec: u64,
    /// Burst allowance in bytes.
    pub burst: u64,
}

impl ByteRate {
    /// Parses `<number><unit>[/s]` where unit is one of B, K, KB, M, MB,
    /// G, GB (any case). A bare number with no unit is rejected.
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let original = s.as_ref();
        let lower = original.trim().to_ascii_lowercase();
        let without_rate = lower.strip_suffix("/s").unwrap_or(&lower);

        let digits_end = without_rate
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(without_rate.len());
        let (number, unit) = without_rate.split_at(digits_end);

        if number.is_empty() {
            return Err(Error::validation(format!(
                "invalid rate \"{}\": missing number",
                original
            )));
        }
        let value: f64 = number.parse().map_err(|_| {
            Error::validation(format!("invalid rate \"{}\": bad number \"{}\"", original, number))
        })?;

        let multiplier: u64 = match unit {
            "b" => 1,
            "k" | "kb" => 1 << 10,
            "m" | "mb" => 1 << 20,
            "g" | "gb" => 1 << 30,
            "" => {
                return Err(Error::validation(format!(
                    "invalid rate \"{}\": a unit is required (B, KB, MB, GB)",
                    original
                )))
            }
            other => {
                return Err(Error::validation(format!(
                    "invalid rate \"{}\": unknown unit \"{}\"",
                    original, other
                )))
            }
        };

        let bytes_per_sec = (value * multiplier as f64) as u64;
        if bytes_per_sec == 0 {
            return Err(Error::validation(format!(
                "invalid rate \"{}\": rate must be positive",
                original
            )));
        }

        Ok(Self {
            bytes_per_sec,
            burst: (bytes_per_sec / 10).max(1024),
        })
    }
}

impl FromStr for ByteRate {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TokenBucket {
    /// Builds a byte-paced bucket from a rate string such as `"500KB/s"`.
    pub fn new_from_string(rate: impl AsRef<str>) -> Result<Self> {
        Ok(Self::from_rate(ByteRate::parse(rate)?))
    }
}

/// Point-in-time view of one identifier's window, from
/// [`RateLimiter::stats`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RateLimiterStats {
    /// Events still permitted in the current window.
    pub remaining: usize,
    /// When the identifier's current window began, if any events are
    /// recorded.
    pub window_start: Option<Instant>,
    /// Whether the identifier is currently over its limit.
    pub blocked: bool,
}

/// A sliding-window event limiter keyed by caller-chosen identifiers:
/// at most `limit` events per identifier within any `window`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    entries: RwLock<HashMap<String, Mutex<VecDeque<Instant>>>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` events per `window` for each
    /// identifier.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Records an event for `id` if the identifier is under its limit,
    /// returning whether the event was admitted.
    pub fn allow(&self, id: &str) -> bool {
        let now = Instant::now();

        {
            let entries = self.entries.read().unwrap();
            if let Some(events) = entries.get(id) {
                return self.admit(&mut events.lock().unwrap(), now);
            }
        }

        let mut entries = self.entries.write().unwrap();
        let events = entries.entry(id.to_string()).or_default();
        let admitted = self.admit(&mut events.lock().unwrap(), now);
        admitted
    }

    /// Forgets all recorded events for `id`.
    pub fn reset(&self, id: &str) {
        self.entries.write().unwrap().remove(id);
    }

    /// Drops identifiers whose windows hold no recent events, bounding
    /// the limiter's memory when identifiers churn.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, events| {
            let mut events = events.lock().unwrap();
            Self::prune(&mut events, now, self.window);
            !events.is_empty()
        });
    }

    /// Reports the state of `id`'s window.
    pub fn stats(&self, id: &str) -> RateLimiterStats {
        let now = Instant::now();
        let entries = self.entries.read().unwrap();
        match entries.get(id) {
            Some(events) => {
                let mut events = events.lock().unwrap();
                Self::prune(&mut events, now, self.window);
                RateLimiterStats {
                    remaining: self.limit.saturating_sub(events.len()),
                    window_start: events.front().copied(),
                    blocked: events.len() >= self.limit,
                }
            }
            None => RateLimiterStats {
                remaining: self.limit,
                window_start: None,
                blocked: false,
            },
        }
    }

    fn admit(&self, events: &mut VecDeque<Instant>, now: Instant) -> bool {
        Self::prune(events, now, self.window);
        if events.len() < self.limit {
            events.push_back(now);
            true
        } else {
            false
        }
    }

    fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&front) = events.front() {
            if now.duration_since(front) >= window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ByteRate, RateLimiter};

    #[test]
    fn rate_strings_parse_with_binary_units() {
        let rate = ByteRate::parse("1MB/s").unwrap();
        assert_eq!(rate.bytes_per_sec, 1_048_576);
        assert_eq!(rate.burst, 104_857);

        let rate = ByteRate::parse("500KB/s").unwrap();
        assert_eq!(rate.bytes_per_sec, 512_000);
        assert_eq!(rate.burst, 51_200);

        // Units are case-insensitive and "/s" is optional.
        assert_eq!(ByteRate::parse("7b").unwrap().bytes_per_sec, 7);
        assert_eq!(ByteRate::parse("2g").unwrap().bytes_per_sec, 2 << 30);
    }

    #[test]
    fn burst_has_a_floor() {
        assert_eq!(ByteRate::parse("4KB/s").unwrap().burst, 1024);
    }

    #[test]
    fn bare_numbers_and_junk_are_rejected() {
        for case in ["7", "", "MB/s", "fast", "1TB/s", "-5KB/s"] {
            assert!(ByteRate::parse(case).is_err(), "expected error for {:?}", case);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_admits_then_blocks_then_recovers() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(limiter.allow("client"));
        }
        assert!(!limiter.allow("client"));
        assert!(limiter.stats("client").blocked);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.allow("client"));
        assert_eq!(limiter.stats("client").remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_quiet_identifiers() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        assert!(limiter.allow("loud"));
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(limiter.allow("recent"));

        limiter.cleanup();
        let entries = limiter.entries.read().unwrap();
        assert!(!entries.contains_key("loud"));
        assert!(entries.contains_key("recent"));
    }

    #[tokio::test(start_paused = true)]
    async fn identifiers_are_independent_and_resettable() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));

        limiter.reset("a");
        assert!(limiter.allow("a"));
    }
}
