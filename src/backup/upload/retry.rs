use crate::backup::pipeline::cancel::Cancellation;
use crate::backup::upload::{StoreError, StoreResult};
use bon::Builder;
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

fn default_retry_limit() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn validate_delays(config: &RetryConfig) -> Result<(), ValidationError> {
    if config.base_delay > config.max_delay {
        let mut error = ValidationError::new("retry_delays");
        error.message = Some("base_delay must not exceed max_delay".into());
        return Err(error);
    }
    Ok(())
}

/// Bounded exponential backoff for transient store errors
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, CopyGetters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_delays))]
#[getset(get_copy = "pub")]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_retry_limit")]
    #[builder(default = default_retry_limit())]
    #[validate(range(max = 100))]
    limit: u32,

    #[serde(default = "default_base_delay", with = "humantime_serde")]
    #[builder(default = default_base_delay())]
    base_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    #[builder(default = default_max_delay())]
    max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `attempt` (1-based): the base delay doubled
    /// per earlier retry, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryError {
    /// Permanent error, or transient errors until the budget ran out
    Failed { attempts: u32, error: StoreError },
    /// The run was cancelled while waiting to retry
    Cancelled,
}

/// Runs `op` until it succeeds, fails permanently or exhausts the retry budget
///
/// Back-off sleeps return early when `cancel` fires.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    cancel: &Cancellation,
    what: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> StoreResult<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt <= config.limit => {
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    attempt,
                    config.limit + 1,
                    delay,
                    error
                );
                if cancel.sleep(delay) {
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
            Err(error) => {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error,
                })
            }
        }
    }
}
