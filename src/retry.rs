//! Bounded exponential backoff for transient store failures
//!
//! Only failures where `StoreError::is_transient()` holds are retried.
//! Delay before retry `n` (0-based) is `min(base * factor^n, cap)`.
//! Exhaustion yields `StoreError::RetriesExhausted` wrapping the last cause,
//! which the core surfaces as a `Database` error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::observability::Logger;
use crate::store::{StoreError, StoreResult};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retry policy applied to every store read, write and delete.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    sleeper: Sleeper,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
            max_delay,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Replace the sleep function (tests use a recorder so they do not wait).
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the retry following failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op`, retrying transient failures.
    ///
    /// `operation` names the call in log events and in the exhaustion error.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> StoreResult<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt >= self.max_retries {
                        Logger::error(
                            "retry.exhausted",
                            &[
                                ("operation", operation),
                                ("retries", &self.max_retries.to_string()),
                                ("error", &e.to_string()),
                            ],
                        );
                        return Err(StoreError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: self.max_retries,
                            source: Box::new(e),
                        });
                    }

                    let delay = self.delay_for(attempt);
                    Logger::warn(
                        "retry.attempt",
                        &[
                            ("operation", operation),
                            ("attempt", &format!("{}/{}", attempt + 1, self.max_retries)),
                            ("delay_ms", &delay.as_millis().to_string()),
                            ("error", &e.to_string()),
                        ],
                    );
                    (self.sleeper)(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            DEFAULT_BASE_DELAY,
            DEFAULT_BACKOFF_FACTOR,
            DEFAULT_MAX_DELAY,
        )
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Mutex;

    fn recording_policy(max_retries: u32) -> (RetryPolicy, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&slept);
        let policy = RetryPolicy::new(
            max_retries,
            DEFAULT_BASE_DELAY,
            DEFAULT_BACKOFF_FACTOR,
            DEFAULT_MAX_DELAY,
        )
        .with_sleeper(move |d| sink.lock().unwrap().push(d));
        (policy, slept)
    }

    #[test]
    fn test_default_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn test_success_after_transient_failures() {
        let (policy, slept) = recording_policy(3);
        let calls = Cell::new(0);
        let result = policy.run("blob.put", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Connection("reset".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
        assert_eq!(
            *slept.lock().unwrap(),
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
    }

    #[test]
    fn test_non_transient_not_retried() {
        let (policy, slept) = recording_policy(3);
        let calls = Cell::new(0);
        let result: StoreResult<()> = policy.run("metadata.insert", || {
            calls.set(calls.get() + 1);
            Err(StoreError::DuplicateKey("identity".into()))
        });
        assert!(matches!(result, Err(StoreError::DuplicateKey(_))));
        assert_eq!(calls.get(), 1);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_exhaustion_wraps_last_cause() {
        let (policy, slept) = recording_policy(3);
        let calls = Cell::new(0);
        let result: StoreResult<()> = policy.run("blob.get", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Timeout(format!("attempt {}", calls.get())))
        });
        assert_eq!(calls.get(), 4);
        assert_eq!(slept.lock().unwrap().len(), 3);
        match result {
            Err(StoreError::RetriesExhausted { operation, attempts, source }) => {
                assert_eq!(operation, "blob.get");
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("attempt 4"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_none_policy_fails_fast() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = RetryPolicy::none().run("op", || {
            calls.set(calls.get() + 1);
            Err(StoreError::ServerSelection("no primary".into()))
        });
        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(StoreError::RetriesExhausted { .. })));
    }
}
