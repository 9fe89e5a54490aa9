//! Circuit breaker, retry, time limit and fallback around one service.

use std::future::Future;
use std::time::Duration;

use crate::error::ServiceError;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, RetryPolicy};

/// Why a protected call produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailureKind {
    /// The service answered with a business rejection.
    Rejected,
    /// The breaker refused the call.
    CircuitOpen,
    /// Every attempt failed transiently.
    RetriesExhausted,
}

/// The uniform failure value returned by [`ResilientClient::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub service: String,
    pub operation: &'static str,
    pub kind: CallFailureKind,
    pub attempts: u32,
    pub message: String,
}

impl CallFailure {
    /// True when the fallback produced this failure rather than the service.
    pub fn is_fallback(&self) -> bool {
        self.kind != CallFailureKind::Rejected
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.service, self.operation, self.message)
    }
}

/// Wraps calls to one downstream service.
///
/// Each attempt must obtain a permit from the breaker and finish within
/// `call_timeout`. Transient failures are retried with backoff; business
/// rejections return immediately and count as healthy responses. When the
/// breaker is open or the attempts run out the fallback produces a
/// [`CallFailure`], so callers never see a panic or a raw transport error.
#[derive(Debug)]
pub struct ResilientClient {
    service: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ResilientClient {
    pub fn new(
        service: impl Into<String>,
        breaker: CircuitBreakerConfig,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        let service = service.into();
        Self {
            breaker: CircuitBreaker::new(service.clone(), breaker),
            service,
            retry,
            call_timeout,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Runs `call` under the breaker, retry policy and per-attempt timeout.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let Some(permit) = self.breaker.try_acquire() else {
                return Err(self.fallback(
                    operation,
                    CallFailureKind::CircuitOpen,
                    attempt - 1,
                    format!("{} is unavailable (circuit breaker open)", self.service),
                ));
            };

            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout),
            };

            match result {
                Ok(value) => {
                    permit.success();
                    if attempt > 1 {
                        tracing::info!(service = %self.service, operation, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(ServiceError::Rejected(reason)) => {
                    permit.success();
                    tracing::debug!(service = %self.service, operation, %reason, "call rejected");
                    return Err(CallFailure {
                        service: self.service.clone(),
                        operation,
                        kind: CallFailureKind::Rejected,
                        attempts: attempt,
                        message: reason,
                    });
                }
                Err(error) => {
                    permit.failure();
                    if !self.retry.should_retry(attempt) {
                        return Err(self.fallback(
                            operation,
                            CallFailureKind::RetriesExhausted,
                            attempt,
                            format!("{} is unavailable after {attempt} attempts: {error}", self.service),
                        ));
                    }
                    let backoff = self.retry.backoff_for(attempt);
                    tracing::warn!(
                        service = %self.service,
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %error,
                        "transient call failure, retrying"
                    );
                    metrics::counter!("saga_call_retries_total", "service" => self.service.clone())
                        .increment(1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn fallback(
        &self,
        operation: &'static str,
        kind: CallFailureKind,
        attempts: u32,
        message: String,
    ) -> CallFailure {
        tracing::warn!(service = %self.service, operation, ?kind, attempts, %message, "circuit breaker fallback");
        metrics::counter!("circuit_breaker_fallback_total", "service" => self.service.clone())
            .increment(1);
        CallFailure {
            service: self.service.clone(),
            operation,
            kind,
            attempts,
            message,
        }
    }
}
