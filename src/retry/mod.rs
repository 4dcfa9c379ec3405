//! Retry policy and per-task retry ledger
//!
//! This module provides:
//! - The fetch error taxonomy ([`FetchError`], [`ErrorKind`])
//! - [`RetryPolicy`]: a stateless backoff/jitter calculator
//! - [`RetryLedger`]: the attempt counter carried by every task
//!
//! Retrying is an explicit state machine: the outcome handler consults the
//! policy, records the result in the task's ledger and requeues the task with
//! a `not_before`. Nothing sleeps in a loop.

mod error;

pub use error::{parse_retry_after, ErrorKind, FetchError, MAX_RETRY_AFTER};

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter, bounded by a maximum attempt count
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_proxy_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            max_proxy_retries: RetryConfig::default().max_proxy_retries,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_proxy_retries: config.max_proxy_retries,
        }
    }

    pub fn with_max_proxy_retries(mut self, max_proxy_retries: u32) -> Self {
        self.max_proxy_retries = max_proxy_retries;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_proxy_retries(&self) -> u32 {
        self.max_proxy_retries
    }

    /// Creates the ledger a new task starts with
    pub fn new_ledger(&self) -> RetryLedger {
        RetryLedger::new(self.max_attempts, self.base_delay)
    }

    /// Exponential part of the delay: `min(max_delay, base_delay * 2^attempt_count)`
    ///
    /// Non-decreasing in `attempt_count`.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let factor = 1u32 << attempt_count.min(31);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the next dispatch of a task that failed with `error`
    ///
    /// A server-provided wait hint takes precedence (capped at
    /// [`MAX_RETRY_AFTER`]); otherwise the backoff plus `jitter(0, base_delay)`.
    ///
    /// # Arguments
    ///
    /// * `attempt_count` - Attempts charged to the task so far
    /// * `error` - The classified failure
    pub fn next_delay(&self, attempt_count: u32, error: &FetchError) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint.min(MAX_RETRY_AFTER);
        }
        self.backoff(attempt_count) + self.jitter()
    }

    /// Whether a task with `attempt_count` charged attempts may be dispatched
    /// again after failing with `kind`
    pub fn should_retry(&self, attempt_count: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt_count < self.max_attempts
    }

    /// Whether another uncharged proxy retry is allowed
    pub fn should_retry_proxy(&self, proxy_retries: u32) -> bool {
        proxy_retries < self.max_proxy_retries
    }

    fn jitter(&self) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=base_ms))
    }
}

/// Attempt bookkeeping carried by a single task
#[derive(Debug, Clone, PartialEq)]
pub struct RetryLedger {
    attempt_count: u32,
    max_attempts: u32,
    base_delay: Duration,
    proxy_retries: u32,
    last_error_kind: Option<ErrorKind>,
    last_error: Option<String>,
}

impl RetryLedger {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            base_delay,
            proxy_retries: 0,
            last_error_kind: None,
            last_error: None,
        }
    }

    /// Charges one dispatch to the task
    pub fn record_attempt(&mut self) {
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
    }

    /// Returns the last charged attempt (the outcome was not the task's fault)
    pub fn refund_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_sub(1);
    }

    pub fn record_error(&mut self, error: &FetchError) {
        if error.kind() == ErrorKind::Proxy {
            self.proxy_retries += 1;
        }
        self.last_error_kind = Some(error.kind());
        self.last_error = Some(error.to_string());
    }

    /// True once every allowed attempt has been charged
    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn proxy_retries(&self) -> u32 {
        self.proxy_retries
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error_kind
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Clears everything; used when a finished task is crawled again
    pub fn reset(&mut self) {
        *self = Self::new(self.max_attempts, self.base_delay);
    }
}
