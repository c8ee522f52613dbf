//! Retry and backoff policy
//!
//! A failed processing pass counts once against the post's retry budget no
//! matter how many platforms failed in it. The delay before the next pass
//! grows exponentially from `base_delay` and is capped at `max_delay`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Post, PostStatus, RetryState, MAX_RETRIES_CEILING};

/// Parameters shared by every post the dispatcher retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retry limit given to new posts that do not set their own
    pub max_retries: u32,
    #[serde(with = "crate::config::duration_str")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "crate::config::duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::types::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: crate::types::DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of consulting the policy after a failed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryPolicy {
    /// Delay before retry number `count` (1-based).
    ///
    /// `base_delay * multiplier^(count - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, count: u32, multiplier: f64) -> Duration {
        let exponent = count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier.powi(exponent)
        } else {
            1.0
        };
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Decide whether a post whose retry count has already been advanced
    /// for this pass gets another attempt.
    pub fn decide(&self, retry: &RetryState, now: DateTime<Utc>) -> RetryDecision {
        let limit = retry.max_retries.min(MAX_RETRIES_CEILING);
        if retry.count >= limit {
            return RetryDecision {
                retry: false,
                next_retry_at: None,
            };
        }

        let delay = self.delay_for(retry.count, retry.backoff_multiplier);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RetryDecision {
            retry: true,
            next_retry_at: now.checked_add_signed(delay),
        }
    }

    /// Record a failed pass on `post` and move it to `pending` or `failed`.
    ///
    /// The post must be `processing`.
    pub fn apply_failure(&self, post: &mut Post, now: DateTime<Utc>) -> crate::Result<RetryDecision> {
        post.retry.record_failed_pass();
        let decision = self.decide(&post.retry, now);

        if decision.retry {
            post.retry.last_retry_at = Some(now);
            post.retry.next_retry_at = decision.next_retry_at;
            post.transition(PostStatus::Pending, now)?;
        } else {
            post.retry.next_retry_at = None;
            post.transition(PostStatus::Failed, now)?;
        }
        Ok(decision)
    }
}
