//! Resilience policies for data-access calls.
//!
//! - [`RetryPolicy`]: retries every failure immediately
//! - [`ResiliencePolicy`]: retries transient faults with backoff and jitter,
//!   behind a [`CircuitBreaker`]
//!
//! [`Policy`] wraps either one so callers can hold a policy without being
//! generic over it.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit};
pub use retry::{ResiliencePolicy, RetryPolicy};

use crate::error::DbResult;
use std::future::Future;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Policy {
    Retry(RetryPolicy),
    Resilience(ResiliencePolicy),
}

impl Policy {
    /// Run `action` under the wrapped policy.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, action: F) -> DbResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        match self {
            Policy::Retry(policy) => policy.execute(cancel, action).await,
            Policy::Resilience(policy) => policy.execute(cancel, action).await,
        }
    }
}

impl From<RetryPolicy> for Policy {
    fn from(policy: RetryPolicy) -> Self {
        Policy::Retry(policy)
    }
}

impl From<ResiliencePolicy> for Policy {
    fn from(policy: ResiliencePolicy) -> Self {
        Policy::Resilience(policy)
    }
}
