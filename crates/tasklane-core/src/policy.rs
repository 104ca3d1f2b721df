//! Per-job retention and retry policies.

use crate::TaskError;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seven days, the default age after which terminal jobs are purged.
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted retention, one hundred years.
pub const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// How long terminal jobs stay inspectable before the broker deletes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Age of a completed job before removal (in seconds)
    pub remove_on_complete_secs: u64,
    /// Age of a failed job before removal (in seconds)
    pub remove_on_fail_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            remove_on_complete_secs: DEFAULT_RETENTION_SECS,
            remove_on_fail_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl RetentionPolicy {
    /// `None` when the age does not fit a `TimeDelta`, meaning never expire
    pub fn complete_age(&self) -> Option<TimeDelta> {
        age(self.remove_on_complete_secs)
    }

    pub fn fail_age(&self) -> Option<TimeDelta> {
        age(self.remove_on_fail_secs)
    }

    /// Reject ages above `MAX_RETENTION_SECS`
    pub fn validate(&self) -> crate::Result<()> {
        for secs in [self.remove_on_complete_secs, self.remove_on_fail_secs] {
            if secs > MAX_RETENTION_SECS {
                return Err(TaskError::InvalidRetention {
                    secs,
                    max: MAX_RETENTION_SECS,
                });
            }
        }
        Ok(())
    }
}

fn age(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

/// Retry configuration applied to every published job.
///
/// The default allows a single attempt: a failing job is marked failed and
/// never redelivered by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total delivery attempts, the first one included
    pub max_attempts: u32,
    /// Base delay for exponential backoff (in seconds)
    pub base_delay_secs: u64,
    /// Maximum delay cap (in seconds)
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay_secs: 5,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_secs: u64, max_delay_secs: u64) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_secs,
            max_delay_secs,
        }
    }

    /// Whether a job that has used `attempts` deliveries may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt: base_delay * 2^(attempts - 1), capped.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let delay = self.base_delay_secs.saturating_mul(2u64.pow(exponent));
        Duration::from_secs(delay.min(self.max_delay_secs))
    }
}
