//! Retry and backoff policies for rulesync's transport layer.
//!
//! Two distinct failure classes drive two distinct code paths (spec §4.1):
//! network/parse failures back off by a constant delay with jitter, while
//! rate-limit responses sleep for exactly what the server told us plus a
//! small fudge factor. They are kept as separate functions rather than one
//! generic strategy enum because the rate-limit path is never a guess.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of attempts for a transport call. `0` means retry forever.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Margin added on top of the server-reported `x-rate-limit-reset` value so
/// the retry doesn't land exactly on the edge of the window.
const RATE_LIMIT_FUDGE: Duration = Duration::from_millis(50);

/// Retry budget and backoff shape for network/parse failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts before giving up. `0` means unlimited.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Constant delay applied between attempts, before jitter.
    #[serde(default = "default_base_delay_ms", rename = "base_delay_ms")]
    pub base_delay: DurationMs,
    /// Jitter factor (0.0 = none, 1.0 = full jitter).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Millisecond-granularity duration; the config file stores plain integers
/// rather than `humantime` strings since retry delays here are always short.
pub type DurationMs = u64;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> DurationMs {
    250
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Whether a call that has already made `attempt` attempts (1-indexed)
    /// may try again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Constant backoff delay for attempt `attempt` (1-indexed), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let _ = attempt; // constant backoff: independent of attempt number
        apply_jitter(Duration::from_millis(self.base_delay), self.jitter)
    }
}

/// Delay to sleep after a rate-limited response whose `x-rate-limit-reset`
/// header reported `reset_millis` milliseconds until the next window.
pub fn rate_limit_delay(reset_millis: u64) -> Duration {
    Duration::from_millis(reset_millis) + RATE_LIMIT_FUDGE
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).max(0.0).round() as u64;
    Duration::from_millis(millis)
}
