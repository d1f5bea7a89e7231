use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::ByteRate;

/// A token bucket: permits accumulate at a fixed rate up to a capacity and
/// are consumed in bursts. Refill is lazy; tokens materialize when the
/// bucket is inspected, never in the background.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket holding at most `capacity` tokens, refilled at
    /// `refill_per_sec` tokens per second. A full bucket is ready
    /// immediately.
    pub fn new(capacity: u64, refill_per_sec: u64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a bucket paced at `rate`, with the rate's burst as capacity.
    pub fn from_rate(rate: ByteRate) -> Self {
        Self::new(rate.burst, rate.bytes_per_sec)
    }

    /// Non-blocking acquisition: takes `n` tokens if available right now.
    pub fn allow(&self, n: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        let n = (n as f64).min(self.capacity);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Waits until `n` tokens are available and takes them. Requests above
    /// the bucket's capacity are clamped to it, since they could otherwise
    /// never be satisfied. Dropping the returned future abandons the wait
    /// without consuming anything.
    pub async fn wait(&self, n: u64) {
        loop {
            let needed = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                let n = (n as f64).min(self.capacity);
                if state.tokens >= n {
                    state.tokens -= n;
                    return;
                }
                n - state.tokens
            };

            tokio::time::sleep(self.duration_for(needed)).await;
        }
    }

    /// An estimate of how long acquiring `n` tokens would block right now.
    pub(crate) fn eta(&self, n: u64) -> Duration {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        let n = (n as f64).min(self.capacity);
        if state.tokens >= n {
            Duration::ZERO
        } else {
            self.duration_for(n - state.tokens)
        }
    }

    /// The number of whole tokens available right now.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        state.tokens as u64
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    fn duration_for(&self, tokens: f64) -> Duration {
        if self.refill_per_sec <= 0.0 {
            // A zero-rate bucket never refills; poll slowly so a
            // cancelled waiter can still be dropped.
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64(tokens / self.refill_per_sec)
    }
}
