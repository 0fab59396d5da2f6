//! Retry strategies.
//!
//! Both strategies run the same attempt loop. Each attempt gets a child of
//! the caller's cancellation token; when a per-attempt timeout is set and
//! fires, the child is cancelled and the failure is final. Caller
//! cancellation is final as well. The action runs at most
//! `max_retries + 1` times and the last failure is returned.

use crate::error::{DbError, DbResult};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a failed attempt is handled.
enum Outcome {
    Retry,
    Stop,
}

/// The shared attempt loop.
async fn run_attempts<T, F, Fut>(
    cancel: &CancellationToken,
    max_retries: u32,
    attempt_timeout: Option<Duration>,
    breaker: Option<&CircuitBreaker>,
    classify: impl Fn(&DbError) -> Outcome,
    delay: impl Fn(u32) -> Duration,
    mut action: F,
) -> DbResult<T>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(DbError::cancelled("resilient call"));
        }
        let permit = breaker.map(CircuitBreaker::try_acquire).transpose()?;

        let token = cancel.child_token();
        let mut timed_out = false;
        let result = match attempt_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, action(token.clone())).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        timed_out = true;
                        Err(DbError::timeout(
                            format!("attempt {attempt}"),
                            limit.as_millis() as u64,
                        ))
                    }
                }
            }
            None => action(token).await,
        };

        let error = match result {
            Ok(value) => {
                if let Some(permit) = permit {
                    permit.succeeded();
                }
                if attempt > 1 {
                    debug!(attempt, "Call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        // Cancellation leaves the permit unresolved; other errors mean the backend answered
        if let Some(permit) = permit {
            if timed_out || error.is_transient() {
                permit.failed();
            } else if !cancel.is_cancelled() && !error.is_cancelled() {
                permit.succeeded();
            }
        }

        let exhausted = attempt > max_retries;
        let terminal = timed_out || cancel.is_cancelled() || error.is_cancelled();
        if exhausted || terminal || matches!(classify(&error), Outcome::Stop) {
            if exhausted && max_retries > 0 {
                warn!(attempts = attempt, error = %error, "Retries exhausted");
            }
            return Err(error);
        }

        let wait = delay(attempt);
        debug!(
            attempt,
            max_retries,
            delay_ms = wait.as_millis() as u64,
            error = %error,
            "Retrying after failure"
        );
        if !wait.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DbError::cancelled("resilient call")),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Retries every failure immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, action: F) -> DbResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        run_attempts(
            cancel,
            self.max_retries,
            self.attempt_timeout,
            None,
            |_| Outcome::Retry,
            |_| Duration::ZERO,
            action,
        )
        .await
    }
}

/// Retries transient faults with exponential backoff behind a circuit breaker.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub attempt_timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
            attempt_timeout: None,
            breaker: Some(Arc::new(CircuitBreaker::default())),
        }
    }
}

impl ResiliencePolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(Arc::new(CircuitBreaker::new(config)));
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.breaker = None;
        self
    }

    /// The breaker shared by every call through this policy and its clones.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_deref()
    }

    /// Backoff before retrying after failed attempt `attempt` (1-based).
    ///
    /// Without jitter this is `base_delay * 2^(attempt - 1)`, capped at
    /// `max_delay`; jitter adds up to one more `base_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // cap the exponent to keep the multiplier in range
        let exponent = (attempt - 1).min(30);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);

        let base_ms = self.base_delay.as_millis() as u64;
        if self.jitter && base_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..base_ms);
            backoff + Duration::from_millis(jitter)
        } else {
            backoff
        }
    }

    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, action: F) -> DbResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        run_attempts(
            cancel,
            self.max_retries,
            self.attempt_timeout,
            self.breaker.as_deref(),
            |e| {
                if e.is_transient() {
                    Outcome::Retry
                } else {
                    Outcome::Stop
                }
            },
            |attempt| self.delay_for_attempt(attempt),
            action,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32, calls: &AtomicU32) -> impl Future<Output = DbResult<u32>> + '_ {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= failures {
                Err(DbError::connection(format!("failure {n}"), "retry"))
            } else {
                Ok(n)
            }
        }
    }

    fn fast_policy(max_retries: u32) -> ResiliencePolicy {
        ResiliencePolicy::new(max_retries, Duration::from_millis(1))
            .with_jitter(false)
            .without_circuit_breaker()
    }

    #[tokio::test]
    async fn test_fail_fail_succeed() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let result = policy
            .execute(&CancellationToken::new(), |_| flaky(2, &calls))
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_always_failing_runs_max_plus_one() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let err = policy
            .execute(&CancellationToken::new(), |_| flaky(u32::MAX, &calls))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("failure 4"));

        let calls = AtomicU32::new(0);
        let err = RetryPolicy::new(3)
            .execute(&CancellationToken::new(), |_| flaky(u32::MAX, &calls))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("failure 4"));
    }

    #[tokio::test]
    async fn test_non_transient_not_retried_by_strict_policy() {
        let calls = AtomicU32::new(0);
        let result: DbResult<()> = fast_policy(3)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DbError::invalid_argument("bad")) }
            })
            .await;
        assert!(matches!(result, Err(DbError::InvalidArgument { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // the simple policy retries anything
        let calls = AtomicU32::new(0);
        let _ = RetryPolicy::new(2)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DbError::invalid_argument("bad")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_terminal() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5).with_attempt_timeout(Duration::from_millis(20));
        let err = policy
            .execute(&CancellationToken::new(), |token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    token.cancelled().await;
                    Ok::<_, DbError>(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_caller_cancellation_is_terminal() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .execute(&cancel, |_| flaky(0, &calls))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_fails_fast() {
        let policy = ResiliencePolicy::new(0, Duration::ZERO).with_circuit_breaker(
            CircuitBreakerConfig {
                failure_threshold: 2,
                cool_down: Duration::from_secs(60),
            },
        );
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let _ = policy
                .execute(&CancellationToken::new(), |_| flaky(u32::MAX, &calls))
                .await;
        }
        let err = policy
            .execute(&CancellationToken::new(), |_| flaky(u32::MAX, &calls))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = ResiliencePolicy::new(5, Duration::from_millis(100)).with_jitter(false);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));

        let capped = policy.clone().with_max_delay(Duration::from_millis(300));
        assert_eq!(capped.delay_for_attempt(4), Duration::from_millis(300));

        let jittered = policy.with_jitter(true);
        let d = jittered.delay_for_attempt(2);
        assert!(d >= Duration::from_millis(200) && d < Duration::from_millis(300));
    }

    fn tripping_policy() -> ResiliencePolicy {
        ResiliencePolicy::new(0, Duration::ZERO).with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            cool_down: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn test_non_transient_trial_closes_circuit() {
        let policy = tripping_policy();
        let calls = AtomicU32::new(0);
        let _ = policy
            .execute(&CancellationToken::new(), |_| flaky(u32::MAX, &calls))
            .await;
        assert_eq!(policy.circuit_breaker().unwrap().state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = policy
            .execute(&CancellationToken::new(), |_| async {
                Err::<(), _>(DbError::invalid_argument("bad"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
        assert_eq!(policy.circuit_breaker().unwrap().state(), CircuitState::Closed);

        for _ in 0..3 {
            let value = policy
                .execute(&CancellationToken::new(), |_| async { Ok::<_, DbError>(7) })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
    }

    #[tokio::test]
    async fn test_abandoned_trial_lets_next_call_through() {
        let policy = tripping_policy();
        let calls = AtomicU32::new(0);
        let _ = policy
            .execute(&CancellationToken::new(), |_| flaky(u32::MAX, &calls))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the trial call hangs and its future is dropped
        let hung = tokio::time::timeout(
            Duration::from_millis(20),
            policy.execute(&CancellationToken::new(), |_| {
                std::future::pending::<DbResult<()>>()
            }),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(
            policy.circuit_breaker().unwrap().state(),
            CircuitState::HalfOpen
        );

        // a cancelled trial resolves nothing either
        let cancel = CancellationToken::new();
        let err = policy
            .execute(&cancel, |_| {
                cancel.cancel();
                async { Err::<(), _>(DbError::cancelled("query")) }
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(
            policy.circuit_breaker().unwrap().state(),
            CircuitState::HalfOpen
        );

        policy
            .execute(&CancellationToken::new(), |_| async { Ok::<_, DbError>(()) })
            .await
            .unwrap();
        assert_eq!(policy.circuit_breaker().unwrap().state(), CircuitState::Closed);
    }
}
