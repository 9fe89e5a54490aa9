//! Outbound call protection: circuit breaker, retry and fallback.

pub mod circuit_breaker;
pub mod client;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, Permit,
};
pub use client::{CallFailure, CallFailureKind, ResilientClient};
pub use retry::RetryPolicy;
