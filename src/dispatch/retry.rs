//! Retry classification and backoff budget

use crate::config::BackoffConfig;
use crate::error::DispatchError;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

/// Outcome of one attempt at processing a job message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Nothing left to do for this message
    Done,
    /// Run the attempt again after a backoff delay
    RetrySameAttempt,
    /// Stop retrying and fail the job with this error
    Fatal(DispatchError),
}

/// Decide what to do with an attempt's error. Only the kind matters.
pub fn classify(err: DispatchError, self_resend: bool) -> RetryDecision {
    match err {
        // The node already holds exactly what a resend was asked to push
        DispatchError::KnownTransaction(_) if self_resend => RetryDecision::Done,
        DispatchError::Connection(_)
        | DispatchError::InvalidNonceWarning(_)
        | DispatchError::KnownTransaction(_) => RetryDecision::RetrySameAttempt,
        other => RetryDecision::Fatal(other),
    }
}

/// Builds a retry budget per message
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn budget(&self) -> RetryBudget {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_interval_ms))
            .with_multiplier(self.config.multiplier)
            .with_max_interval(Duration::from_millis(self.config.max_interval_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.config.max_elapsed_ms)))
            .build();
        RetryBudget {
            backoff,
            attempts: 0,
            max_attempts: self.config.max_attempts,
        }
    }
}

/// Attempts and elapsed time spent on one message
#[derive(Debug)]
pub struct RetryBudget {
    backoff: ExponentialBackoff,
    attempts: u32,
    max_attempts: u32,
}

impl RetryBudget {
    /// Record a failed attempt and return the delay before the next one,
    /// or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.backoff.next_backoff()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retried() {
        assert_eq!(
            classify(DispatchError::Connection("timeout".into()), false),
            RetryDecision::RetrySameAttempt
        );
        assert_eq!(
            classify(DispatchError::InvalidNonceWarning("nonce too low".into()), false),
            RetryDecision::RetrySameAttempt
        );
    }

    #[test]
    fn known_transaction_depends_on_resend() {
        let err = DispatchError::KnownTransaction("already known".into());
        assert_eq!(classify(err.clone(), true), RetryDecision::Done);
        assert_eq!(classify(err, false), RetryDecision::RetrySameAttempt);
    }

    #[test]
    fn other_errors_are_fatal() {
        let err = DispatchError::Encoding("bad signature".into());
        assert_eq!(classify(err.clone(), false), RetryDecision::Fatal(err));

        let err = DispatchError::InvalidNonce("exhausted".into());
        assert_eq!(classify(err.clone(), true), RetryDecision::Fatal(err));
    }

    #[test]
    fn budget_is_bounded_by_attempts() {
        let policy = RetryPolicy::new(BackoffConfig {
            initial_interval_ms: 1,
            multiplier: 2.0,
            max_interval_ms: 10,
            max_elapsed_ms: 60_000,
            max_attempts: 3,
        });
        let mut budget = policy.budget();

        assert!(budget.next_delay().is_some());
        assert!(budget.next_delay().is_some());
        assert!(budget.next_delay().is_none());
        assert_eq!(budget.attempts(), 3);
    }
}
