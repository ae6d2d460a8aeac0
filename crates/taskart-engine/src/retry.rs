use std::thread;
use std::time::Duration;

use taskart_contracts::errors::{ErrorClassifier, GenerationError};
use tracing::{debug, warn};

const MAX_BACKOFF_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff slept after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, GenerationError>,
    pub attempts: u32,
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. Each failure is classified once.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    classifier: &ErrorClassifier,
    mut attempt: impl FnMut(u32) -> anyhow::Result<T>,
) -> RetryOutcome<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut current = 1;
    loop {
        let err = match attempt(current) {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: current,
                }
            }
            Err(err) => err,
        };
        let classified = classifier.classify(&err);
        if !classified.retryable || current >= max_attempts {
            warn!(
                "attempt {current}/{max_attempts} failed ({}); giving up",
                classified.kind
            );
            return RetryOutcome {
                result: Err(classified),
                attempts: current,
            };
        }
        let delay = policy.delay_after(current);
        debug!(
            "attempt {current}/{max_attempts} failed ({}); retrying in {:?}: {}",
            classified.kind, delay, classified.message
        );
        thread::sleep(delay);
        current += 1;
    }
}
