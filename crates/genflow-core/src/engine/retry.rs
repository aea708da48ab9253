//! Bounded retry of transient database failures

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{DatabaseError, EngineError};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again
    Retry(Duration),
    /// Transient, but the attempt budget is spent
    Exhausted,
    /// Not retryable
    Fatal,
}

/// Maximum attempts (first try included) and the fixed wait between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_backoff())
    }

    /// Decision after attempt number `attempt` (1-based) failed with `err`
    pub fn decide(&self, err: &DatabaseError, attempt: u32) -> RetryDecision {
        if !err.is_transient() {
            RetryDecision::Fatal
        } else if attempt >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.backoff)
        }
    }

    /// Run `op` until it succeeds, fails fatally or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    }
                },
                Err(err) => match self.decide(&err, attempt) {
                    RetryDecision::Retry(wait) => {
                        warn!(
                            operation = what,
                            attempt,
                            max_attempts = self.max_attempts,
                            code = err.code().unwrap_or(""),
                            "Transient database error, retrying: {}",
                            err
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    },
                    RetryDecision::Exhausted => {
                        return RetryOutcome::Exhausted {
                            attempts: attempt,
                            last: err,
                        }
                    },
                    RetryDecision::Fatal => return RetryOutcome::Fatal(err),
                },
            }
        }
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    Exhausted { attempts: u32, last: DatabaseError },
    Fatal(DatabaseError),
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> Result<T, EngineError> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted { attempts, last } => Err(EngineError::RetriesExhausted { attempts, last }),
            RetryOutcome::Fatal(err) => Err(err.into()),
        }
    }
}
