//! Exponential backoff for the event long-poll.
//!
//! Each consecutive transient failure waits `base * 2^(failures - 1)`,
//! clamped to [`RetryConfig::max_delay`]. The counter resets on any
//! successful poll. Reaching [`RetryConfig::max_failures`] consecutive
//! failures ends the subscription with an error.

use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Consecutive failures that exhaust the budget.
    pub max_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

/// Delay to wait after the `failures`-th consecutive failure.
///
/// `failures` is 1-based; zero yields no delay.
pub fn backoff_delay(failures: u32, config: &RetryConfig) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// The failure budget is spent.
    GiveUp,
}

/// Consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.config.max_failures {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(backoff_delay(self.failures, &self.config))
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }
}
