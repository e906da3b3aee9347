//! Run-wide settings and per-step retry policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to later stages after a stage fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// No later stage starts on any host
    #[default]
    FailFast,
    /// Failed hosts drop out; later stages run on the remaining hosts
    ContinueUnaffected,
}

/// Settings for one pipeline run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Evaluate guards only, never apply
    pub dry_run: bool,
    /// Stage failure handling
    pub failure_policy: FailurePolicy,
    /// Deadline for remote commands of steps without their own timeout
    pub command_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            failure_policy: FailurePolicy::FailFast,
            command_timeout: Duration::from_secs(300),
        }
    }
}

/// Bounded retry with exponential backoff, opted into per step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub backoff: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// `attempts` tries starting with `backoff` between them
    #[must_use]
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}
