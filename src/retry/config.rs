//! Retry and dead letter configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Retry policy and dead letter settings, read once at startup.
///
/// Field names mirror the `dead_letter` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_delay_bounds"))]
pub struct RetryPolicyConfig {
    /// Total handler attempts before a message is quarantined
    #[validate(range(min = 1, message = "max_retry_attempts must be at least 1"))]
    pub max_retry_attempts: u32,

    /// Delay before the first retry, in seconds
    #[validate(range(min = 0.0, message = "initial_retry_delay_seconds must not be negative"))]
    pub initial_retry_delay_seconds: f64,

    /// Growth factor applied to the delay after each attempt
    #[validate(range(min = 1.0, message = "backoff_multiplier must be at least 1.0"))]
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay, in seconds (at most one day)
    #[validate(range(
        min = 0.0,
        max = 86400.0,
        message = "max_retry_delay_seconds must be between 0 and 86400"
    ))]
    pub max_retry_delay_seconds: f64,

    /// How long quarantined messages are kept, in hours (at most one year)
    #[validate(range(min = 1, max = 8760, message = "dead_letter_ttl_hours must be between 1 and 8760"))]
    pub dead_letter_ttl_hours: u64,

    /// Log every failed attempt with its error
    pub enable_detailed_logging: bool,

    /// Notify the admin hook when a message is quarantined
    pub enable_admin_notifications: bool,
}

fn validate_delay_bounds(config: &RetryPolicyConfig) -> Result<(), ValidationError> {
    if !config.initial_retry_delay_seconds.is_finite()
        || !config.max_retry_delay_seconds.is_finite()
        || !config.backoff_multiplier.is_finite()
    {
        return Err(ValidationError::new("non_finite_retry_setting"));
    }

    if config.initial_retry_delay_seconds > config.max_retry_delay_seconds {
        let mut err = ValidationError::new("initial_delay_exceeds_max_delay");
        err.message = Some("initial_retry_delay_seconds must not exceed max_retry_delay_seconds".into());
        return Err(err);
    }

    Ok(())
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            initial_retry_delay_seconds: 2.0,
            backoff_multiplier: 2.0,
            max_retry_delay_seconds: 300.0,
            dead_letter_ttl_hours: 24 * 7,
            enable_detailed_logging: false,
            enable_admin_notifications: false,
        }
    }
}

impl RetryPolicyConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        seconds_to_duration(self.initial_retry_delay_seconds)
    }

    pub fn max_retry_delay(&self) -> Duration {
        seconds_to_duration(self.max_retry_delay_seconds)
    }

    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_letter_ttl_hours.saturating_mul(3600))
    }
}

/// Seconds as a duration, saturating instead of panicking on NaN, negative or
/// out-of-range input
pub(crate) fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}
