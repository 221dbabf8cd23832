use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Attempts that use the exponential schedule before switching to jitter.
const EXPONENTIAL_ATTEMPTS: u32 = 6;

/// Lower bound of the jittered wait.
const JITTER_MIN: Duration = Duration::from_secs(90);

/// Upper bound (exclusive) of the jittered wait.
const JITTER_MAX: Duration = Duration::from_secs(180);

/// Default span of continuous success after which the streak resets.
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(5 * 60);

/// Retry delay policy shared by the control link, the log link, the data
/// shipper and QAN configuration.
///
/// Attempts 1..=6 wait `2^n - 1` seconds, later attempts wait a random
/// duration in `[90s, 180s)` that never drops below the previous wait of the
/// same streak. The streak resets only once successes have been reported
/// without a failure in between for at least `reset_after`.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    last_wait: Duration,
    success_since: Option<Instant>,
    reset_after: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_reset_after(DEFAULT_RESET_AFTER)
    }

    pub fn with_reset_after(reset_after: Duration) -> Self {
        Self {
            attempt: 0,
            last_wait: Duration::ZERO,
            success_since: None,
            reset_after,
        }
    }

    /// Number of failures in the current streak.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Register a failure and return how long to wait before retrying.
    pub fn wait_time(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.success_since = None;

        let wait = if self.attempt <= EXPONENTIAL_ATTEMPTS {
            Duration::from_secs((1u64 << self.attempt) - 1)
        } else {
            let jitter = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
            jitter.max(self.last_wait).min(JITTER_MAX)
        };

        self.last_wait = wait;
        wait
    }

    /// Register a success.
    pub fn success(&mut self) {
        self.success_at(Instant::now());
    }

    fn success_at(&mut self, now: Instant) {
        let since = *self.success_since.get_or_insert(now);

        if now.saturating_duration_since(since) >= self.reset_after {
            self.attempt = 0;
            self.last_wait = Duration::ZERO;
        }
    }

    /// Register a failure and sleep the resulting wait. Returns false if the
    /// token was cancelled before the wait elapsed.
    pub async fn sleep(&mut self, cancel: &CancellationToken) -> bool {
        let wait = self.wait_time();

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}
