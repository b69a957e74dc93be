// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Resilience primitives (retry policy + circuit breaker + bulkhead) and the
//! pipeline that composes them around a storage call.
//!
//! Composition, outermost first:
//!
//! ```text
//! Bulkhead ─► Retry (exponential backoff) ─► CircuitBreaker ─► Timeout ─► call
//! ```
//!
//! The timeout sits inside the breaker so a timed-out attempt is recorded as
//! a breaker failure and then retried like any other transient error.

mod bulkhead;
mod circuit;

pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadRejected};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};

use rand::random;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Classifies errors that are worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    /// Three attempts, waiting 2^attempt seconds before each retry.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = base * jitter_factor;
        let clamped = jittered.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(clamped)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

/// Failure of a single attempt.
#[derive(Debug, Error)]
pub enum AttemptError<E: std::error::Error + 'static> {
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Inner(E),
}

impl<E: std::error::Error + Transient + 'static> Transient for AttemptError<E> {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Timeout(_) => true,
            AttemptError::Inner(e) => e.is_transient(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResilienceError<E: std::error::Error + 'static> {
    #[error("Circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
    #[error(transparent)]
    BulkheadRejected(BulkheadRejected),
    #[error("All {attempts} retry attempts exhausted. Last error: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: AttemptError<E>,
    },
    #[error("Non-retryable failure: {0}")]
    Fatal(E),
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
    /// Hard ceiling per attempt
    pub attempt_timeout: Duration,
    pub bulkhead_max_concurrent: usize,
    pub bulkhead_max_queued: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(),
            circuit: CircuitConfig::default(),
            attempt_timeout: Duration::from_secs(30),
            bulkhead_max_concurrent: 100,
            bulkhead_max_queued: 500,
        }
    }
}

/// Fixed policy chain applied to every call against one backend.
pub struct ResiliencePipeline {
    retry_policy: RetryPolicy,
    attempt_timeout: Duration,
    circuit_breaker: CircuitBreaker,
    bulkhead: Bulkhead,
}

impl ResiliencePipeline {
    pub fn new(name: &str, config: ResilienceConfig) -> Self {
        Self {
            retry_policy: config.retry,
            attempt_timeout: config.attempt_timeout,
            circuit_breaker: CircuitBreaker::new(name, config.circuit),
            bulkhead: Bulkhead::new(
                name,
                config.bulkhead_max_concurrent,
                config.bulkhead_max_queued,
            ),
        }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    /// Run `operation` through the chain. `operation` is invoked once per
    /// attempt; non-transient errors are returned as [`ResilienceError::Fatal`]
    /// without retrying.
    pub async fn execute<F, Fut, T, E>(
        &self,
        label: &'static str,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Transient + 'static,
    {
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(ResilienceError::BulkheadRejected)?;

        let max_attempts = self.retry_policy.max_attempts.max(1);
        let timeout = self.attempt_timeout;
        let mut attempt = 0;

        loop {
            let outcome = self
                .circuit_breaker
                .call(|| {
                    let call = operation();
                    async move {
                        match tokio::time::timeout(timeout, call).await {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(e)) => Err(AttemptError::Inner(e)),
                            Err(_) => Err(AttemptError::Timeout(timeout)),
                        }
                    }
                })
                .await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(CircuitError::Open { retry_after }) => {
                    warn!(
                        operation = label,
                        breaker = %self.circuit_breaker.name(),
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Circuit open, failing fast"
                    );
                    return Err(ResilienceError::CircuitOpen { retry_after });
                }
                Err(CircuitError::Inner(AttemptError::Inner(e))) if !e.is_transient() => {
                    return Err(ResilienceError::Fatal(e));
                }
                Err(CircuitError::Inner(error)) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(ResilienceError::Exhausted {
                            attempts: max_attempts,
                            last_error: error,
                        });
                    }

                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    debug!(operation = label, attempt = attempt + 1, "Retrying");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("fatal")]
        Fatal,
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn pipeline(threshold: u32) -> ResiliencePipeline {
        ResiliencePipeline::new(
            "test",
            ResilienceConfig {
                circuit: CircuitConfig {
                    failure_threshold: threshold,
                    open_duration: Duration::from_secs(30),
                },
                attempt_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            jitter: 0.1,
            ..RetryPolicy::exponential()
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1).as_secs_f64();
            assert!((1.8..=2.2).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let pipeline = pipeline(10);
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = pipeline
            .execute("op", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let pipeline = pipeline(10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = pipeline
            .execute("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Fatal(TestError::Fatal))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried_then_exhausted() {
        let pipeline = pipeline(10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = pipeline
            .execute("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), TestError>(())
            })
            .await;

        match result {
            Err(ResilienceError::Exhausted {
                attempts,
                last_error: AttemptError::Timeout(_),
            }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.circuit_breaker().failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retries() {
        let pipeline = pipeline(2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = pipeline
            .execute("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.circuit_breaker().state(), CircuitState::Open);
    }
}
