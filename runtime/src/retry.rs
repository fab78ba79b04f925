//! Delayed-retry policy for failed message handlers.
//!
//! A failed delivery is re-published to the retry exchange with a per-message
//! TTL. The TTL grows exponentially with the attempt number and is capped:
//!
//! | attempt | delay   |
//! |---------|---------|
//! | 0       | 0 s     |
//! | 1       | 2 s     |
//! | 2       | 4 s     |
//! | 7       | 128 s   |
//! | ≥ 8     | 180 s   |
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::retry::{RetryLimit, RetryPolicy, delay_for};
//! use std::time::Duration;
//!
//! assert_eq!(delay_for(1), Duration::from_secs(2));
//!
//! let policy = RetryPolicy::new(RetryLimit::Limited(2));
//! let retry = policy.next_retry(0).unwrap();
//! assert_eq!(retry.retry_count, 1);
//! assert_eq!(retry.delay, Duration::from_secs(2));
//! assert!(policy.next_retry(2).is_none());
//! ```

use std::time::Duration;

/// Upper bound of the retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(180);

/// Delay before redelivery attempt `attempt` (1-based).
///
/// `0` for `attempt == 0`, otherwise `min(2^attempt, 180)` seconds.
#[must_use]
pub fn delay_for(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let secs = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_RETRY_DELAY)
}

/// How many redeliveries a consumer allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryLimit {
    /// Retry forever.
    #[default]
    Unlimited,
    /// Retry at most `n` times (`0` disables retries).
    Limited(u32),
}

impl RetryLimit {
    /// Interpret the conventional integer form: negative = unlimited.
    #[must_use]
    pub fn from_max_retry(max_retry: i64) -> Self {
        if max_retry < 0 {
            Self::Unlimited
        } else {
            Self::Limited(u32::try_from(max_retry).unwrap_or(u32::MAX))
        }
    }

    /// Whether a message already retried `retried_count` times may be retried again.
    #[must_use]
    pub const fn allows(self, retried_count: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(max) => retried_count < max,
        }
    }
}

impl From<i64> for RetryLimit {
    fn from(max_retry: i64) -> Self {
        Self::from_max_retry(max_retry)
    }
}

/// A retry the consumer should schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    /// Value of `x-retry-count` on the retry copy.
    pub retry_count: u32,
    /// Per-message TTL before redelivery.
    pub delay: Duration,
}

/// Retry limit plus backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    limit: RetryLimit,
}

impl RetryPolicy {
    /// Create a policy with the given limit.
    #[must_use]
    pub const fn new(limit: RetryLimit) -> Self {
        Self { limit }
    }

    /// The configured limit.
    #[must_use]
    pub const fn limit(&self) -> RetryLimit {
        self.limit
    }

    /// The retry to schedule after a failure of a message retried `retried_count` times,
    /// or `None` once the limit is exhausted.
    #[must_use]
    pub fn next_retry(&self, retried_count: u32) -> Option<ScheduledRetry> {
        if !self.limit.allows(retried_count) {
            return None;
        }
        let retry_count = retried_count.saturating_add(1);
        Some(ScheduledRetry {
            retry_count,
            delay: delay_for(retry_count),
        })
    }
}
