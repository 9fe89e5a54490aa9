use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SagaId;

/// Unique identifier for an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of audit events recorded for a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaEventType {
    SagaStarted,
    StateTransition,
    ServiceCallStarted,
    ServiceCallCompleted,
    ServiceCallFailed,
    /// The breaker was open or retries ran out; distinct from a rejection.
    CircuitBreakerFallback,
    Retry,
    CompensationStarted,
    CompensationCompleted,
    CompensationFailure,
    /// Payment was captured but the sale failed. Needs manual follow-up.
    PaymentReversalRequired,
    SagaCompleted,
    SagaFailed,
    Timeout,
    Error,
}

impl SagaEventType {
    pub const ALL: [SagaEventType; 15] = [
        SagaEventType::SagaStarted,
        SagaEventType::StateTransition,
        SagaEventType::ServiceCallStarted,
        SagaEventType::ServiceCallCompleted,
        SagaEventType::ServiceCallFailed,
        SagaEventType::CircuitBreakerFallback,
        SagaEventType::Retry,
        SagaEventType::CompensationStarted,
        SagaEventType::CompensationCompleted,
        SagaEventType::CompensationFailure,
        SagaEventType::PaymentReversalRequired,
        SagaEventType::SagaCompleted,
        SagaEventType::SagaFailed,
        SagaEventType::Timeout,
        SagaEventType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaEventType::SagaStarted => "SagaStarted",
            SagaEventType::StateTransition => "StateTransition",
            SagaEventType::ServiceCallStarted => "ServiceCallStarted",
            SagaEventType::ServiceCallCompleted => "ServiceCallCompleted",
            SagaEventType::ServiceCallFailed => "ServiceCallFailed",
            SagaEventType::CircuitBreakerFallback => "CircuitBreakerFallback",
            SagaEventType::Retry => "Retry",
            SagaEventType::CompensationStarted => "CompensationStarted",
            SagaEventType::CompensationCompleted => "CompensationCompleted",
            SagaEventType::CompensationFailure => "CompensationFailure",
            SagaEventType::PaymentReversalRequired => "PaymentReversalRequired",
            SagaEventType::SagaCompleted => "SagaCompleted",
            SagaEventType::SagaFailed => "SagaFailed",
            SagaEventType::Timeout => "Timeout",
            SagaEventType::Error => "Error",
        }
    }
}

impl std::fmt::Display for SagaEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown saga event type: {s}"))
    }
}

/// Append-only audit record for one saga.
///
/// Written once and never read back by the orchestration logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaEventRecord {
    pub event_id: EventId,
    pub saga_id: SagaId,
    pub event_type: SagaEventType,

    /// Free-form details (service name, error message, state names).
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,

    /// Creation order, assigned by the store on append. Zero until stored.
    pub sequence: i64,
}

impl SagaEventRecord {
    pub fn new(saga_id: SagaId, event_type: SagaEventType, payload: serde_json::Value) -> Self {
        Self {
            event_id: EventId::new(),
            saga_id,
            event_type,
            payload,
            created_at: Utc::now(),
            sequence: 0,
        }
    }

    /// Overrides the creation timestamp.
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}
