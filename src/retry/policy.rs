//! Retry decisions and backoff computation

use crate::messaging::MessagingError;
use crate::retry::config::{seconds_to_duration, RetryPolicyConfig};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Pure retry policy: classification plus exponential backoff without jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

/// Values resolved by [`RetryPolicy::self_check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySelfCheck {
    pub max_retry_attempts: u32,
    pub transient_retried_at_first_attempt: bool,
    pub permanent_retried_at_first_attempt: bool,
    pub retried_at_max_attempt: bool,
    pub delays_ms: Vec<u64>,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    /// Whether a failed attempt should be followed by another one.
    ///
    /// `attempt_number` is the 1-based number of the attempt that just failed.
    /// Always false once the attempt budget is spent, and never true for
    /// cancellation or permanent failures.
    pub fn should_retry(&self, error: &MessagingError, attempt_number: u32) -> bool {
        if attempt_number >= self.config.max_retry_attempts {
            return false;
        }
        if error.is_cancellation() {
            return false;
        }
        error.is_transient()
    }

    /// Delay to wait after failed attempt `attempt_number` (1-based):
    /// `min(initial * multiplier^(n-1), max)`.
    pub fn calculate_retry_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial = self.config.initial_retry_delay_seconds.max(0.0);
        let max = self.config.max_retry_delay_seconds.max(0.0);
        let delay = initial * self.config.backoff_multiplier.powi(exponent);

        // powi overflows to infinity for large attempt numbers; clamp first
        let bounded = if delay.is_finite() { delay.min(max) } else { max };
        seconds_to_duration(bounded)
    }

    /// Sum of every backoff wait one message can go through before it is
    /// quarantined
    pub fn total_backoff(&self) -> Duration {
        (1..self.config.max_retry_attempts)
            .map(|n| self.calculate_retry_delay(n))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Exercise both policy functions with synthetic errors and log the
    /// resolved values. Verifies wiring only, not broker reachability.
    pub fn self_check(&self) -> PolicySelfCheck {
        let transient = MessagingError::Timeout("startup self-check".to_string());
        let permanent = MessagingError::DeserializationError("startup self-check".to_string());
        let max = self.config.max_retry_attempts;

        let report = PolicySelfCheck {
            max_retry_attempts: max,
            transient_retried_at_first_attempt: self.should_retry(&transient, 1),
            permanent_retried_at_first_attempt: self.should_retry(&permanent, 1),
            retried_at_max_attempt: self.should_retry(&transient, max),
            delays_ms: (1..=max)
                .map(|n| u64::try_from(self.calculate_retry_delay(n).as_millis()).unwrap_or(u64::MAX))
                .collect(),
        };

        info!(
            max_retry_attempts = report.max_retry_attempts,
            transient_retried = report.transient_retried_at_first_attempt,
            permanent_retried = report.permanent_retried_at_first_attempt,
            delays_ms = ?report.delays_ms,
            dead_letter_ttl_hours = self.config.dead_letter_ttl_hours,
            "Retry policy self-check"
        );

        report
    }
}
