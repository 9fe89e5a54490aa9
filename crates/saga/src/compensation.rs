//! Rollback of partially completed sagas.

use std::sync::Arc;

use common::SagaId;
use saga_store::{
    SagaEventType, SagaExecution, SagaRepository, SagaRepositoryExt, SagaState, StoreError,
};
use serde::Serialize;
use serde_json::json;

use crate::audit::AuditLog;
use crate::concurrency::ConcurrencyCoordinator;
use crate::error::{Result, SagaError};
use crate::services::{ReleaseStockRequest, ServiceGateway};

/// What a compensation run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationReport {
    pub saga_id: SagaId,
    /// The saga was already finalized, so nothing was done.
    pub already_terminal: bool,
    pub stock_released: bool,
    pub release_error: Option<String>,
    pub payment_reversal_required: bool,
    pub final_state: SagaState,
}

impl CompensationReport {
    fn noop(saga_id: SagaId, final_state: SagaState) -> Self {
        Self {
            saga_id,
            already_terminal: true,
            stock_released: false,
            release_error: None,
            payment_reversal_required: false,
            final_state,
        }
    }
}

fn is_terminal_write(err: &SagaError) -> bool {
    matches!(err, SagaError::Store(StoreError::TerminalSaga { .. }))
}

/// Undoes the work a failed saga recorded and finalizes it as failed.
///
/// The recorded identifiers are the only input: stock is released exactly
/// when a reservation ID is stored. Payment reversal is never automated;
/// a paid saga without an order is flagged for manual follow-up.
pub struct CompensationExecutor<R> {
    repo: Arc<R>,
    coordinator: Arc<ConcurrencyCoordinator<R>>,
    gateway: Arc<ServiceGateway>,
    audit: AuditLog<R>,
}

impl<R: SagaRepository> CompensationExecutor<R> {
    pub fn new(
        repo: Arc<R>,
        coordinator: Arc<ConcurrencyCoordinator<R>>,
        gateway: Arc<ServiceGateway>,
        audit: AuditLog<R>,
    ) -> Self {
        Self {
            repo,
            coordinator,
            gateway,
            audit,
        }
    }

    /// Compensates the saga and moves it to `SALE_FAILED` with `reason` as
    /// its error message.
    ///
    /// Calling this on a terminal saga does nothing. A failed stock release
    /// is recorded on the saga but still finalizes it. The final write only
    /// lands while the stored reservation and payment IDs match the copy
    /// compensation acted on; a step result recorded in between sends the
    /// run back to a fresh read.
    #[tracing::instrument(skip(self), fields(%saga_id))]
    pub async fn compensate(&self, saga_id: SagaId, reason: &str) -> Result<CompensationReport> {
        let mut saga = self.repo.get_required(saga_id).await?;
        if saga.is_terminal() {
            metrics::counter!("saga_compensation_total", "outcome" => "noop").increment(1);
            tracing::debug!(state = %saga.current_state(), "saga already terminal, nothing to compensate");
            return Ok(CompensationReport::noop(saga_id, saga.current_state()));
        }

        tracing::info!(state = %saga.current_state(), reason, "compensation started");
        self.audit
            .record(
                saga_id,
                SagaEventType::CompensationStarted,
                json!({ "state": saga.current_state(), "reason": reason }),
            )
            .await;

        // Reservation this run already tried to release.
        let mut handled_reservation: Option<String> = None;
        let mut stock_released = false;
        let mut release_error = None;
        let max_passes = self.coordinator.retry_config().max_attempts.max(1);

        for pass in 1..=max_passes {
            if let Some(reservation_id) = saga.stock_reservation_id().map(str::to_string)
                && handled_reservation.as_deref() != Some(reservation_id.as_str())
            {
                if saga.current_state() != SagaState::StockReleasing {
                    match self.enter_stock_releasing(&saga).await {
                        Ok(written) => saga = written,
                        Err(e) if is_terminal_write(&e) => {
                            return self.finalized_elsewhere(saga_id).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                match self.release_stock(saga_id, &reservation_id, reason).await {
                    Ok(()) => stock_released = true,
                    Err(message) => release_error = Some(message),
                }
                handled_reservation = Some(reservation_id);
            }

            let message = match &release_error {
                Some(error) => format!("{reason} (stock release failed: {error})"),
                None => reason.to_string(),
            };
            let expected_reservation = saga.stock_reservation_id().map(str::to_string);
            let expected_payment = saga.payment_transaction_id().map(str::to_string);
            let written = self
                .coordinator
                .update_with_retry(saga_id, |s| {
                    if s.stock_reservation_id() != expected_reservation.as_deref()
                        || s.payment_transaction_id() != expected_payment.as_deref()
                    {
                        return Err(StoreError::Stale {
                            saga_id,
                            detail: "step result recorded during compensation".to_string(),
                        });
                    }
                    s.set_error_message(message.clone())?;
                    s.transition_to(SagaState::SaleFailed)
                })
                .await;

            match written {
                Ok(_) => {
                    return Ok(self
                        .finish(&saga, reason, message, stock_released, release_error)
                        .await);
                }
                Err(SagaError::Store(StoreError::Stale { .. })) => {
                    tracing::info!(pass, "step result recorded during compensation, re-reading saga");
                    saga = self.repo.get_required(saga_id).await?;
                    if saga.is_terminal() {
                        return self.finalized_elsewhere(saga_id).await;
                    }
                }
                Err(e) if is_terminal_write(&e) => return self.finalized_elsewhere(saga_id).await,
                Err(e) => {
                    tracing::error!(error = %e, "could not finalize compensated saga");
                    return Err(SagaError::CompensationFailure {
                        saga_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::error!(passes = max_passes, "saga kept changing during compensation");
        Err(SagaError::CompensationFailure {
            saga_id,
            reason: format!("saga changed during {max_passes} compensation passes"),
        })
    }

    async fn enter_stock_releasing(&self, saga: &SagaExecution) -> Result<SagaExecution> {
        let from = saga.current_state();
        let written = self
            .coordinator
            .update_with_retry(saga.saga_id(), |s| {
                if s.current_state() == SagaState::StockReleasing {
                    return Ok(());
                }
                s.transition_to(SagaState::StockReleasing)
            })
            .await?;
        self.audit
            .record(
                saga.saga_id(),
                SagaEventType::StateTransition,
                json!({ "from": from, "to": SagaState::StockReleasing }),
            )
            .await;
        Ok(written)
    }

    /// Releases one recorded reservation. Errors carry the failure message.
    async fn release_stock(
        &self,
        saga_id: SagaId,
        reservation_id: &str,
        reason: &str,
    ) -> std::result::Result<(), String> {
        let request = ReleaseStockRequest {
            reservation_id: reservation_id.to_string(),
            reason: reason.to_string(),
            saga_id,
        };
        match self.gateway.release_stock(&request).await {
            Ok(()) => {
                tracing::info!(reservation_id, "stock released");
                self.audit
                    .record(
                        saga_id,
                        SagaEventType::CompensationCompleted,
                        json!({ "reservation_id": reservation_id }),
                    )
                    .await;
                Ok(())
            }
            Err(failure) => {
                tracing::error!(reservation_id, error = %failure, "stock release failed, manual follow-up required");
                self.audit.record_call_failure(saga_id, &failure).await;
                self.audit
                    .record(
                        saga_id,
                        SagaEventType::CompensationFailure,
                        json!({ "reservation_id": reservation_id, "message": failure.message }),
                    )
                    .await;
                Err(failure.message)
            }
        }
    }

    /// Records the outcome of a compensation whose final write landed.
    /// `saga` is the copy the write was checked against.
    async fn finish(
        &self,
        saga: &SagaExecution,
        reason: &str,
        message: String,
        stock_released: bool,
        release_error: Option<String>,
    ) -> CompensationReport {
        let saga_id = saga.saga_id();
        let payment_reversal_required =
            saga.payment_transaction_id().is_some() && saga.order_id().is_none();
        if let Some(transaction_id) = saga.payment_transaction_id()
            && payment_reversal_required
        {
            tracing::warn!(transaction_id, "payment reversal may be required");
            self.audit
                .record(
                    saga_id,
                    SagaEventType::PaymentReversalRequired,
                    json!({ "transaction_id": transaction_id, "reason": reason }),
                )
                .await;
        }

        let outcome = match (saga.stock_reservation_id(), stock_released) {
            (None, _) => "no_reservation",
            (Some(_), true) => "released",
            (Some(_), false) => "release_failed",
        };
        metrics::counter!("saga_compensation_total", "outcome" => outcome).increment(1);
        metrics::counter!("saga_failed_total").increment(1);
        self.audit
            .record(
                saga_id,
                SagaEventType::StateTransition,
                json!({ "from": saga.current_state(), "to": SagaState::SaleFailed }),
            )
            .await;
        self.audit
            .record(saga_id, SagaEventType::SagaFailed, json!({ "reason": message }))
            .await;
        tracing::info!(outcome, "saga failed and compensated");

        CompensationReport {
            saga_id,
            already_terminal: false,
            stock_released,
            release_error,
            payment_reversal_required,
            final_state: SagaState::SaleFailed,
        }
    }

    /// Another writer finalized the saga while this run was in progress.
    async fn finalized_elsewhere(&self, saga_id: SagaId) -> Result<CompensationReport> {
        let saga = self.repo.get_required(saga_id).await?;
        metrics::counter!("saga_compensation_total", "outcome" => "noop").increment(1);
        tracing::info!(state = %saga.current_state(), "saga finalized concurrently, compensation skipped");
        Ok(CompensationReport::noop(saga_id, saga.current_state()))
    }
}
