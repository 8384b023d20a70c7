//! Retry and backoff configuration with jitter support.

use rand::Rng;
use std::time::Duration;

/// The shortened backoff used when a `ConcurrentTransactions` error is
/// observed with no partitions enlisted yet, to shorten the commit/produce
/// interleave.
pub const CONCURRENT_TRANSACTIONS_SHORT_BACKOFF: Duration = Duration::from_millis(20);

/// Jitter mode for retry backoff (following AWS SDK patterns).
#[derive(Clone, Copy, Debug, Default)]
pub enum JitterMode {
    /// No jitter - use exact backoff delay.
    None,
    /// Full jitter: random delay between 0 and calculated backoff.
    #[default]
    Full,
    /// Equal jitter: half fixed + half random.
    Equal,
}

/// Apply jitter to a backoff delay.
pub fn apply_jitter(delay: Duration, mode: JitterMode) -> Duration {
    let mut rng = rand::thread_rng();

    match mode {
        JitterMode::None => delay,
        JitterMode::Full => Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64()),
        JitterMode::Equal => {
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rng.gen::<f64>() * half)
        }
    }
}

/// Fixed backoff used by the sender loop for retriable RPC errors.
///
/// Unlike a client making independent HTTP calls, the sender loop retries a
/// batch that is still strictly ordered ahead of newer batches in its
/// partition queue: an exponentially growing delay would let newer batches
/// pile up behind an old one for longer than necessary, so this crate uses
/// the broker-client convention of a single configured `retry_backoff_ms`
/// (optionally jittered) rather than exponential growth.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter: JitterMode,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            jitter: JitterMode::None,
        }
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn delay(&self) -> Duration {
        apply_jitter(self.base, self.jitter)
    }
}
