//! Retry policies mapping an attempt number to the delay before the next try.
//!
//! A policy answers a single question: given that attempt `n` failed, how
//! long until attempt `n + 1`, or should the lineage stop. The fixed
//! schedule is the only built-in strategy. Endpoints may name `backoff`,
//! which is reserved and rejected when the policy is built.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use hookline_core::{EndpointRetry, RetryStrategy};

use crate::error::{DeliveryError, Result};

/// Maps a failed attempt number to the delay before the next attempt.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Returns the delay before the attempt following `attempt_number`, or
    /// `None` once the schedule is exceeded.
    ///
    /// `attempt_number` is 1-based.
    fn next_delay(&self, attempt_number: u32) -> Option<Duration>;

    /// Upper bound on attempts in one lineage.
    fn max_attempts(&self) -> u32;
}

/// Per-position delay list.
///
/// Position `n` (1-based) holds the delay applied after attempt `n` fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedRetry {
    delays: Vec<Duration>,
}

impl FixedRetry {
    /// Creates a fixed policy from delays in seconds.
    pub fn from_secs(delays: &[u64]) -> Self {
        Self { delays: delays.iter().copied().map(Duration::from_secs).collect() }
    }

    /// Returns the configured delays.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl RetryPolicy for FixedRetry {
    fn next_delay(&self, attempt_number: u32) -> Option<Duration> {
        let index = usize::try_from(attempt_number).ok()?.checked_sub(1)?;
        self.delays.get(index).copied()
    }

    fn max_attempts(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX)
    }
}

/// Builds the policy configured on an endpoint.
///
/// # Errors
///
/// Returns [`DeliveryError::UnsupportedStrategy`] for strategies without an
/// implementation.
pub fn policy_for(retry: &EndpointRetry) -> Result<Box<dyn RetryPolicy>> {
    match retry.strategy {
        RetryStrategy::Fixed => Ok(Box::new(FixedRetry::from_secs(&retry.attempts))),
        RetryStrategy::Backoff => Err(DeliveryError::UnsupportedStrategy {
            strategy: retry.strategy.as_str().to_string(),
        }),
    }
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the successor attempt.
    Retry {
        /// When the successor becomes due
        next_attempt_at: DateTime<Utc>,
    },
    /// The lineage is exhausted.
    Exhausted,
}

/// Decides whether a failure of `attempt_number` at `finished_at` is retried.
///
/// An attempt whose number reaches the policy's maximum is the last one.
pub fn decide(
    policy: &dyn RetryPolicy,
    attempt_number: u32,
    finished_at: DateTime<Utc>,
) -> RetryDecision {
    if attempt_number >= policy.max_attempts() {
        return RetryDecision::Exhausted;
    }

    match policy.next_delay(attempt_number) {
        Some(delay) => {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            let next_attempt_at = finished_at.checked_add_signed(delay).unwrap_or(finished_at);
            RetryDecision::Retry { next_attempt_at }
        },
        None => RetryDecision::Exhausted,
    }
}
