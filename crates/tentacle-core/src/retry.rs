//! Exponential backoff bookkeeping for crash recovery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff limits shared by every recovery loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the delay
    pub max_backoff: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Progress of one plugin's recovery loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    next_backoff: Duration,
    last_attempt: Option<DateTime<Utc>>,
}

impl RetryState {
    /// Fresh state for `policy`
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            next_backoff: policy.initial_backoff.min(policy.max_backoff),
            last_attempt: None,
        }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait before the next attempt
    pub fn next_backoff(&self) -> Duration {
        self.next_backoff
    }

    /// When the last attempt was recorded
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }

    /// Whether another attempt is permitted
    pub fn can_retry(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    /// Record a failed attempt and double the backoff, capped at the policy ceiling
    pub fn advance(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(Utc::now());
        self.next_backoff = self
            .next_backoff
            .checked_mul(2)
            .unwrap_or(self.policy.max_backoff)
            .min(self.policy.max_backoff);
    }

    /// Forget all attempts after a success
    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }
}
