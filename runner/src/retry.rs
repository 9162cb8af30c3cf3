use serde::{Deserialize, Serialize};
use std::{fmt::Debug, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Returned once every attempt of a `RetryPolicy` failed, carrying the last error seen
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetriesExhausted<E: std::fmt::Display> {
    pub attempts: u32,
    pub last: E,
}

/// Bounded retry with exponential backoff between attempts.
///
/// Delays are `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
/// No delay follows the final attempt.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// catalog operations: ten attempts, short backoff
    pub fn catalog() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }

    /// shared filesystem mount: ten attempts, starting at five seconds
    pub fn mount() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_secs(5),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }

    /// same attempt count, no waiting at all
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);

        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }

    /// run `operation` until it succeeds or the attempts are used up, sleeping between attempts
    pub fn run<T, E, F>(&self, operation: F) -> Result<T, RetriesExhausted<E>>
    where
        E: std::fmt::Display + Debug,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with_sleep(operation, thread::sleep)
    }

    /// like `run`, but with the suspend function injected
    pub fn run_with_sleep<T, E, F, S>(
        &self,
        mut operation: F,
        mut sleep: S,
    ) -> Result<T, RetriesExhausted<E>>
    where
        E: std::fmt::Display + Debug,
        F: FnMut(u32) -> Result<T, E>,
        S: FnMut(Duration),
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= attempts => {
                    warn!(attempts = attempts, error = %error, "Giving up after last attempt");

                    return Err(RetriesExhausted {
                        attempts,
                        last: error,
                    });
                }
                Err(error) => {
                    let delay = self.delay_after(attempt);
                    debug!(attempt = attempt, delay = ?delay, error = %error, "Attempt failed, retrying");

                    if !delay.is_zero() {
                        sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
