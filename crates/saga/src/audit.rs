//! Writes the saga audit trail.

use std::sync::Arc;

use common::SagaId;
use saga_store::{SagaEventRecord, SagaEventType, SagaRepository};

use crate::resilience::CallFailure;

/// Appends audit events. A failed append is logged and never fails the
/// saga; the trail is for operators, not for control flow.
pub struct AuditLog<R> {
    repo: Arc<R>,
}

impl<R> Clone for AuditLog<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
        }
    }
}

impl<R: SagaRepository> AuditLog<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub async fn record(&self, saga_id: SagaId, event_type: SagaEventType, payload: serde_json::Value) {
        let event = SagaEventRecord::new(saga_id, event_type, payload);
        if let Err(e) = self.repo.append_event(event).await {
            tracing::error!(%saga_id, event_type = %event_type, error = %e, "failed to append audit event");
        }
    }

    /// Records a failed downstream call, separating fallbacks from
    /// business rejections.
    pub async fn record_call_failure(&self, saga_id: SagaId, failure: &CallFailure) {
        if failure.attempts > 1 {
            self.record(
                saga_id,
                SagaEventType::Retry,
                serde_json::json!({
                    "service": failure.service,
                    "operation": failure.operation,
                    "attempts": failure.attempts,
                }),
            )
            .await;
        }
        let event_type = if failure.is_fallback() {
            SagaEventType::CircuitBreakerFallback
        } else {
            SagaEventType::ServiceCallFailed
        };
        self.record(
            saga_id,
            event_type,
            serde_json::json!({
                "service": failure.service,
                "operation": failure.operation,
                "message": failure.message,
            }),
        )
        .await;
    }
}
