use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

/// Where a retried operation currently stands.
///
/// `Attempting(n)` is the n-th attempt (1-based). A failed attempt moves to
/// `Backoff` while retries remain, otherwise to `Exhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting(usize),
    Backoff { attempt: usize, delay: Duration },
    Exhausted { attempts: usize },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_backoff_ms,
            config.max_backoff_ms,
        )
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn start(&self) -> RetryState {
        RetryState::Attempting(1)
    }

    /// Transition taken when the current attempt fails. `retryable` is false for
    /// failures that another attempt cannot fix.
    pub fn on_failure(&self, state: RetryState, retryable: bool) -> RetryState {
        match state {
            RetryState::Attempting(attempt) => {
                if !retryable || attempt > self.max_retries {
                    RetryState::Exhausted { attempts: attempt }
                } else {
                    RetryState::Backoff {
                        attempt,
                        delay: self.delay_for(attempt),
                    }
                }
            }
            other => other,
        }
    }

    /// Transition taken once the backoff delay has elapsed.
    pub fn after_backoff(&self, state: RetryState) -> RetryState {
        match state {
            RetryState::Backoff { attempt, .. } => RetryState::Attempting(attempt + 1),
            other => other,
        }
    }

    /// Exponential backoff for the retry following `attempt`, capped at the maximum.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let delay = self.initial_backoff.saturating_mul(2u32.saturating_pow(exponent));
        std::cmp::min(delay, self.max_backoff)
    }

    /// Retry a future with exponential backoff, treating every error as retryable
    pub async fn retry<F, Fut, T, E>(&self, operation_name: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut state = self.start();

        loop {
            let RetryState::Attempting(attempt) = state else {
                unreachable!("retry loop only runs attempts");
            };

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempts = attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    state = self.on_failure(state, true);
                    match state {
                        RetryState::Backoff { delay, .. } => {
                            warn!(
                                operation = operation_name,
                                attempt = attempt,
                                max_retries = self.max_retries,
                                backoff_ms = delay.as_millis() as u64,
                                error = %e,
                                "Operation failed, retrying"
                            );
                            sleep(delay).await;
                            state = self.after_backoff(state);
                        }
                        _ => {
                            warn!(
                                operation = operation_name,
                                attempts = attempt,
                                error = %e,
                                "Operation failed after max retries"
                            );
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_state_machine_walks_to_exhaustion() {
        let policy = RetryPolicy::new(2, 100, 1000);
        let mut state = policy.start();
        assert_eq!(state, RetryState::Attempting(1));

        state = policy.on_failure(state, true);
        assert_eq!(
            state,
            RetryState::Backoff { attempt: 1, delay: Duration::from_millis(100) }
        );
        state = policy.after_backoff(state);
        assert_eq!(state, RetryState::Attempting(2));

        state = policy.on_failure(state, true);
        assert_eq!(
            state,
            RetryState::Backoff { attempt: 2, delay: Duration::from_millis(200) }
        );
        state = policy.after_backoff(state);

        state = policy.on_failure(state, true);
        assert_eq!(state, RetryState::Exhausted { attempts: 3 });
    }

    #[test]
    fn test_non_retryable_exhausts_immediately() {
        let policy = RetryPolicy::new(5, 100, 1000);
        let state = policy.on_failure(policy.start(), false);
        assert_eq!(state, RetryState::Exhausted { attempts: 1 });
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(10, 1000, 5000);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new(3, 1, 2);
        let calls = AtomicUsize::new(0);

        let result: Result<usize, String> = policy
            .retry("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(format!("fail {}", n)) } else { Ok(n) }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let policy = RetryPolicy::new(1, 1, 2);
        let calls = AtomicUsize::new(0);

        let result: Result<(), String> = policy
            .retry("broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
