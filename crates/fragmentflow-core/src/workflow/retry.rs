//! Per-node retry accounting and backoff.
//!
//! Stateless: callers track the attempt count and ask the handler whether
//! another attempt is allowed and how long to wait before it.

use std::time::Duration;

use fragmentflow_types::workflow::{BackoffStrategy, RetryPolicy};

/// Upper bound on any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct RetryHandler;

impl RetryHandler {
    /// Whether a node that has failed `failures` times may run again.
    ///
    /// `failures` is 1 after the first failed attempt, so a policy with
    /// `max_retries = 2` allows a total of three attempts.
    pub fn should_retry(policy: &RetryPolicy, failures: u32) -> bool {
        failures <= policy.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// Linear waits `initial * retry`; exponential waits
    /// `initial * 2^(retry - 1)`. Both wait exactly `initial` before the
    /// first retry. Capped at [`MAX_BACKOFF`].
    pub fn backoff(policy: &RetryPolicy, retry: u32) -> Duration {
        let retry = retry.max(1);
        let initial = policy.initial_delay_ms;
        let ms = match policy.backoff_strategy {
            BackoffStrategy::Linear => initial.saturating_mul(u64::from(retry)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
                initial.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms).min(MAX_BACKOFF)
    }
}
