//! Bounded, category-aware retry policy.
//!
//! Per (run, step) the policy walks `no_attempt -> attempt_running ->
//! {succeeded | attempt_failed}`; from `attempt_failed` a new attempt is
//! permitted only for `RETRYABLE` failures with budget remaining. Delays
//! between retryable attempts use configurable backoff and jitter.

use crate::errors::ErrorCategory;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retries_used
    #[default]
    Exponential,
    /// delay = base * (retries_used + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Retry bookkeeping for one (run, step).
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries consumed so far (the first attempt is not a retry).
    pub retries_used: u32,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts made so far, including the first.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.retries_used + 1
    }

    fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base
                .saturating_mul(2u64.saturating_pow(self.retries_used))
                .min(max),
            BackoffStrategy::Linear => base
                .saturating_mul(u64::from(self.retries_used) + 1)
                .min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry(Duration),
    /// The retry budget is exhausted; the step is terminally failed.
    Exhausted,
    /// The failure category forbids retry; the step is terminally failed.
    NotRetryable,
}

/// Decides whether another attempt is permitted after a classified failure.
///
/// Only `RETRYABLE` failures consume budget; the other categories
/// short-circuit to a terminal decision without touching the state.
#[must_use]
pub fn next_decision(
    state: &mut RetryState,
    config: &RetryConfig,
    category: ErrorCategory,
) -> RetryDecision {
    if !category.is_retryable() {
        return RetryDecision::NotRetryable;
    }

    if state.retries_used >= config.max_retries {
        return RetryDecision::Exhausted;
    }

    let delay = state.calculate_delay(config);
    state.retries_used += 1;
    RetryDecision::Retry(delay)
}
