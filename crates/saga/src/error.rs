//! Saga error types.

use common::SagaId;
use saga_store::{SagaState, StoreError};
use thiserror::Error;

/// Errors returned by a downstream capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service understood the request and said no. Never retried.
    #[error("{0}")]
    Rejected(String),

    /// The service could not be reached or failed internally.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The attempt exceeded its time limit.
    #[error("call timed out")]
    Timeout,
}

impl ServiceError {
    /// Returns true for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServiceError::Rejected(_))
    }
}

/// Errors that can occur while running a sale saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Verification reported too little stock. No reservation was made.
    #[error("Insufficient stock available. Requested: {requested}, Available: {available}")]
    InsufficientStock { requested: u32, available: u32 },

    /// A downstream call was rejected by the service.
    #[error("{service} {operation} failed: {message}")]
    ServiceCall {
        service: String,
        operation: String,
        message: String,
    },

    /// The breaker was open or retries ran out; the call never succeeded.
    #[error("{service} {operation} unavailable: {reason}")]
    CircuitBreakerFallback {
        service: String,
        operation: String,
        reason: String,
    },

    /// Version-checked writes kept losing to concurrent writers.
    #[error("Optimistic lock conflict on saga {saga_id} after {attempts} attempts")]
    OptimisticLockConflict { saga_id: SagaId, attempts: u32 },

    /// An earlier saga for the same customer and product is still reserving.
    #[error("Saga {saga_id} yielded to earlier saga {blocking} for key {key}")]
    RaceConditionBlocked {
        saga_id: SagaId,
        blocking: SagaId,
        key: String,
    },

    /// Too many sagas are active for one customer and product.
    #[error("Too many concurrent sagas for {key}: {active} active, limit {limit}")]
    ConcurrentSagaLimitExceeded {
        key: String,
        active: usize,
        limit: usize,
    },

    /// Payment was declined or the payment service was unreachable.
    #[error("Payment processing failed: {0}")]
    PaymentFailure(String),

    /// The order could not be recorded after payment.
    #[error("Order creation failed: {0}")]
    OrderCreationFailure(String),

    /// The saga stalled past its per-state budget.
    #[error("TIMEOUT: Saga timed out in state {state} after {elapsed_secs}s")]
    Timeout { state: SagaState, elapsed_secs: i64 },

    /// Undoing a completed step failed.
    #[error("Compensation failed for saga {saga_id}: {reason}")]
    CompensationFailure { saga_id: SagaId, reason: String },

    /// The sale request is malformed.
    #[error("Invalid sale request: {0}")]
    InvalidRequest(String),

    /// No saga with this ID exists.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The state machine refused the change.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: SagaState, to: SagaState },

    /// Persistence error.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SagaNotFound(id) => SagaError::SagaNotFound(id),
            StoreError::InvalidTransition { from, to } => SagaError::InvalidTransition { from, to },
            other => SagaError::Store(other),
        }
    }
}

impl SagaError {
    /// Stable name used as audit event detail and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            SagaError::InsufficientStock { .. } => "InsufficientStock",
            SagaError::ServiceCall { .. } => "ServiceCallException",
            SagaError::CircuitBreakerFallback { .. } => "CircuitBreakerFallback",
            SagaError::OptimisticLockConflict { .. } => "OptimisticLockConflict",
            SagaError::RaceConditionBlocked { .. } => "RaceConditionBlocked",
            SagaError::ConcurrentSagaLimitExceeded { .. } => "ConcurrentSagaLimitExceeded",
            SagaError::PaymentFailure(_) => "PaymentFailure",
            SagaError::OrderCreationFailure(_) => "OrderCreationFailure",
            SagaError::Timeout { .. } => "Timeout",
            SagaError::CompensationFailure { .. } => "CompensationFailure",
            SagaError::InvalidRequest(_) => "InvalidRequest",
            SagaError::SagaNotFound(_) => "SagaNotFound",
            SagaError::InvalidTransition { .. } => "InvalidTransition",
            SagaError::Store(StoreError::TerminalSaga { .. }) => "SagaAlreadyFinalized",
            SagaError::Store(_) => "StoreError",
        }
    }

    /// Human-readable reason for the caller.
    pub fn user_message(&self) -> String {
        match self {
            SagaError::OptimisticLockConflict { .. } => {
                "Sale could not be completed due to concurrent updates, please retry".to_string()
            }
            SagaError::RaceConditionBlocked { .. } => {
                "Another sale for this customer and product is in progress, please retry"
                    .to_string()
            }
            SagaError::ConcurrentSagaLimitExceeded { .. } => {
                "Too many sales in progress for this customer and product, please retry later"
                    .to_string()
            }
            SagaError::Store(StoreError::TerminalSaga { .. }) => {
                "Sale was already finalized".to_string()
            }
            SagaError::Store(_) => "Sale failed due to an internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Returns true for rejections that carry no compensation work.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            SagaError::InsufficientStock { .. } | SagaError::InvalidRequest(_)
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
