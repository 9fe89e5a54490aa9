//! Drives a sale through verify, reserve, pay and confirm.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::{CustomerId, Money, ProductId, SagaId};
use saga_store::{
    DEFAULT_PAYMENT_METHOD, SagaEventRecord, SagaEventType, SagaExecution, SagaRepository,
    SagaRepositoryExt, SagaState, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::AuditLog;
use crate::compensation::CompensationExecutor;
use crate::concurrency::ConcurrencyCoordinator;
use crate::error::{Result, SagaError};
use crate::resilience::CallFailure;
use crate::services::{
    CreateOrderRequest, INVENTORY_SERVICE, ORDER_SERVICE, PAYMENT_SERVICE, ProcessPaymentRequest,
    ReleaseStockRequest, ReserveStockRequest, ServiceGateway, VerifyStockRequest,
};

const STEP_VERIFY: &str = "verify_stock";
const STEP_RESERVE: &str = "reserve_stock";
const STEP_PAYMENT: &str = "process_payment";
const STEP_ORDER: &str = "create_order";

fn default_payment_method() -> String {
    DEFAULT_PAYMENT_METHOD.to_string()
}

/// A request to sell one product to one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRequest {
    pub customer_id: CustomerId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub amount: Money,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
}

impl SaleRequest {
    pub fn new(
        customer_id: impl Into<CustomerId>,
        product_id: impl Into<ProductId>,
        quantity: u32,
        amount: Money,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            quantity,
            amount,
            payment_method: default_payment_method(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.customer_id.as_str().trim().is_empty() {
            return Err(SagaError::InvalidRequest("customer ID is required".into()));
        }
        if self.product_id.as_str().trim().is_empty() {
            return Err(SagaError::InvalidRequest("product ID is required".into()));
        }
        if self.quantity == 0 {
            return Err(SagaError::InvalidRequest(
                "quantity must be greater than zero".into(),
            ));
        }
        if !self.amount.is_positive() {
            return Err(SagaError::InvalidRequest(
                "amount must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Terminal result of a sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaOutcome {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub message: String,
}

impl SagaOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.state == SagaState::SaleConfirmed
    }

    fn failed(saga_id: SagaId, message: impl Into<String>) -> Self {
        Self {
            saga_id,
            state: SagaState::SaleFailed,
            message: message.into(),
        }
    }
}

/// Counts of persisted sagas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SagaStatistics {
    pub by_state: BTreeMap<String, u64>,
    pub active: u64,
    pub total: u64,
}

/// Maps a failed call in a verification or reservation step.
fn call_error(failure: CallFailure) -> SagaError {
    if failure.is_fallback() {
        SagaError::CircuitBreakerFallback {
            service: failure.service,
            operation: failure.operation.to_string(),
            reason: failure.message,
        }
    } else {
        SagaError::ServiceCall {
            service: failure.service,
            operation: failure.operation.to_string(),
            message: failure.message,
        }
    }
}

/// Runs sale sagas end to end.
///
/// Every state change goes through the [`ConcurrencyCoordinator`], every
/// downstream call through the [`ServiceGateway`]. Any step failure hands
/// the saga to the [`CompensationExecutor`]; callers always get a terminal
/// [`SagaOutcome`].
pub struct SagaOrchestrator<R> {
    repo: Arc<R>,
    coordinator: Arc<ConcurrencyCoordinator<R>>,
    gateway: Arc<ServiceGateway>,
    compensation: Arc<CompensationExecutor<R>>,
    audit: AuditLog<R>,
}

impl<R: SagaRepository> SagaOrchestrator<R> {
    pub fn new(
        repo: Arc<R>,
        coordinator: Arc<ConcurrencyCoordinator<R>>,
        gateway: Arc<ServiceGateway>,
        compensation: Arc<CompensationExecutor<R>>,
        audit: AuditLog<R>,
    ) -> Self {
        Self {
            repo,
            coordinator,
            gateway,
            compensation,
            audit,
        }
    }

    /// Runs a sale to completion and returns its terminal outcome.
    ///
    /// Invalid requests fail before a saga row is written.
    #[tracing::instrument(
        skip(self, request),
        fields(customer_id = %request.customer_id, product_id = %request.product_id, saga_id = tracing::field::Empty)
    )]
    pub async fn execute_sale(&self, request: SaleRequest) -> SagaOutcome {
        let saga_id = SagaId::new();
        tracing::Span::current().record("saga_id", tracing::field::display(saga_id));

        if let Err(e) = request.validate() {
            tracing::warn!(error = %e, "rejecting invalid sale request");
            return SagaOutcome::failed(saga_id, e.user_message());
        }

        let started = Instant::now();
        let saga = SagaExecution::new(
            saga_id,
            request.customer_id,
            request.product_id,
            request.quantity,
            request.amount,
            request.payment_method,
            Utc::now(),
        );
        if let Err(e) = self.repo.insert(&saga).await {
            tracing::error!(error = %e, "could not persist new saga");
            return SagaOutcome::failed(saga_id, SagaError::from(e).user_message());
        }

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(quantity = saga.quantity(), amount = %saga.amount(), "saga started");
        self.audit
            .record(
                saga_id,
                SagaEventType::SagaStarted,
                json!({
                    "customer_id": saga.customer_id(),
                    "product_id": saga.product_id(),
                    "quantity": saga.quantity(),
                    "amount_cents": saga.amount().cents(),
                    "payment_method": saga.payment_method(),
                }),
            )
            .await;

        let outcome = match self.run_steps(saga).await {
            Ok(confirmed) => {
                metrics::counter!("saga_completed_total").increment(1);
                tracing::info!(order_id = confirmed.order_id(), "sale confirmed");
                self.audit
                    .record(
                        saga_id,
                        SagaEventType::SagaCompleted,
                        json!({
                            "stock_reservation_id": confirmed.stock_reservation_id(),
                            "payment_transaction_id": confirmed.payment_transaction_id(),
                            "order_id": confirmed.order_id(),
                        }),
                    )
                    .await;
                SagaOutcome {
                    saga_id,
                    state: SagaState::SaleConfirmed,
                    message: "Sale completed successfully".to_string(),
                }
            }
            Err(e) => self.fail(saga_id, e).await,
        };

        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn run_steps(&self, saga: SagaExecution) -> Result<SagaExecution> {
        let saga = self.advance(&saga, SagaState::StockVerifying).await?;
        self.verify_stock(&saga).await?;

        let saga = self.advance(&saga, SagaState::StockReserving).await?;
        let saga = self.reserve_stock(&saga).await?;

        let saga = self.advance(&saga, SagaState::PaymentProcessing).await?;
        let saga = self.process_payment(&saga).await?;

        let saga = self.advance(&saga, SagaState::OrderConfirming).await?;
        self.confirm_order(&saga).await
    }

    async fn advance(&self, saga: &SagaExecution, to: SagaState) -> Result<SagaExecution> {
        let from = saga.current_state();
        let written = self
            .coordinator
            .update_with_retry(saga.saga_id(), move |s| s.transition_to(to))
            .await?;
        tracing::debug!(saga_id = %saga.saga_id(), %from, %to, "state transition");
        self.audit
            .record(
                saga.saga_id(),
                SagaEventType::StateTransition,
                json!({ "from": from, "to": to }),
            )
            .await;
        Ok(written)
    }

    async fn call_started(&self, saga_id: SagaId, service: &str, step: &str) {
        self.audit
            .record(
                saga_id,
                SagaEventType::ServiceCallStarted,
                json!({ "service": service, "step": step }),
            )
            .await;
    }

    /// Counts and audits the result of a downstream call.
    async fn observe<T>(
        &self,
        saga_id: SagaId,
        step: &'static str,
        result: std::result::Result<T, CallFailure>,
    ) -> std::result::Result<T, CallFailure> {
        match &result {
            Ok(_) => {
                metrics::counter!("saga_step_total", "step" => step, "outcome" => "success")
                    .increment(1);
                self.audit
                    .record(
                        saga_id,
                        SagaEventType::ServiceCallCompleted,
                        json!({ "step": step }),
                    )
                    .await;
            }
            Err(failure) => {
                let outcome = if failure.is_fallback() {
                    "fallback"
                } else {
                    "rejected"
                };
                metrics::counter!("saga_step_total", "step" => step, "outcome" => outcome)
                    .increment(1);
                tracing::warn!(%saga_id, step, error = %failure, "step call failed");
                self.audit.record_call_failure(saga_id, failure).await;
            }
        }
        result
    }

    async fn verify_stock(&self, saga: &SagaExecution) -> Result<()> {
        let saga_id = saga.saga_id();
        let request = VerifyStockRequest {
            product_id: saga.product_id().clone(),
            quantity: saga.quantity(),
            saga_id,
        };
        self.call_started(saga_id, INVENTORY_SERVICE, STEP_VERIFY).await;
        let result = self
            .coordinator
            .verify_shared(saga.product_id(), || self.gateway.verify_stock(&request))
            .await;
        let check = self
            .observe(saga_id, STEP_VERIFY, result)
            .await
            .map_err(call_error)?;

        if !check.available {
            tracing::info!(%saga_id, requested = saga.quantity(), available = check.available_quantity, "insufficient stock");
            return Err(SagaError::InsufficientStock {
                requested: saga.quantity(),
                available: check.available_quantity,
            });
        }
        Ok(())
    }

    async fn reserve_stock(&self, saga: &SagaExecution) -> Result<SagaExecution> {
        let saga_id = saga.saga_id();
        let request = ReserveStockRequest {
            product_id: saga.product_id().clone(),
            quantity: saga.quantity(),
            saga_id,
            customer_id: saga.customer_id().clone(),
        };
        self.call_started(saga_id, INVENTORY_SERVICE, STEP_RESERVE).await;
        let result = self
            .coordinator
            .reserve_exclusive(saga, || self.gateway.reserve_stock(&request))
            .await?;
        let reservation_id = self
            .observe(saga_id, STEP_RESERVE, result)
            .await
            .map_err(call_error)?;

        let recorded = reservation_id.clone();
        match self
            .coordinator
            .update_exclusive(saga_id, move |s| s.record_stock_reservation(recorded.clone()))
            .await
        {
            Ok(written) => {
                tracing::info!(%saga_id, %reservation_id, "stock reserved");
                Ok(written)
            }
            Err(e) => {
                // Compensation only sees recorded reservations.
                tracing::warn!(%saga_id, %reservation_id, error = %e, "reservation could not be recorded, releasing it");
                self.release_orphan(saga_id, &reservation_id).await;
                Err(e)
            }
        }
    }

    async fn release_orphan(&self, saga_id: SagaId, reservation_id: &str) {
        let request = ReleaseStockRequest {
            reservation_id: reservation_id.to_string(),
            reason: "orphaned reservation".to_string(),
            saga_id,
        };
        match self.gateway.release_stock(&request).await {
            Ok(()) => {
                self.audit
                    .record(
                        saga_id,
                        SagaEventType::CompensationCompleted,
                        json!({ "reservation_id": reservation_id, "orphan": true }),
                    )
                    .await;
            }
            Err(failure) => {
                tracing::error!(%saga_id, reservation_id, error = %failure, "orphaned reservation could not be released");
                self.audit.record_call_failure(saga_id, &failure).await;
                self.audit
                    .record(
                        saga_id,
                        SagaEventType::CompensationFailure,
                        json!({ "reservation_id": reservation_id, "orphan": true, "message": failure.message }),
                    )
                    .await;
            }
        }
    }

    async fn process_payment(&self, saga: &SagaExecution) -> Result<SagaExecution> {
        let saga_id = saga.saga_id();
        let request = ProcessPaymentRequest {
            customer_id: saga.customer_id().clone(),
            amount: saga.amount(),
            payment_method: saga.payment_method().to_string(),
            saga_id,
            product_id: saga.product_id().clone(),
            quantity: saga.quantity(),
        };
        self.call_started(saga_id, PAYMENT_SERVICE, STEP_PAYMENT).await;
        let result = self.gateway.process_payment(&request).await;
        let transaction_id = self
            .observe(saga_id, STEP_PAYMENT, result)
            .await
            .map_err(|failure| SagaError::PaymentFailure(failure.message))?;

        let recorded = transaction_id.clone();
        match self
            .coordinator
            .update_exclusive(saga_id, move |s| {
                s.record_payment_transaction(recorded.clone())
            })
            .await
        {
            Ok(written) => {
                tracing::info!(%saga_id, %transaction_id, "payment processed");
                Ok(written)
            }
            Err(e) => {
                tracing::warn!(%saga_id, %transaction_id, error = %e, "payment could not be recorded, payment reversal may be required");
                self.audit
                    .record(
                        saga_id,
                        SagaEventType::PaymentReversalRequired,
                        json!({ "transaction_id": transaction_id, "reason": e.user_message() }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn confirm_order(&self, saga: &SagaExecution) -> Result<SagaExecution> {
        let saga_id = saga.saga_id();
        let (Some(reservation_id), Some(transaction_id)) =
            (saga.stock_reservation_id(), saga.payment_transaction_id())
        else {
            return Err(SagaError::Store(StoreError::Corrupt(format!(
                "saga {saga_id} reached order confirmation without reservation and payment"
            ))));
        };
        let request = CreateOrderRequest {
            customer_id: saga.customer_id().clone(),
            product_id: saga.product_id().clone(),
            quantity: saga.quantity(),
            amount: saga.amount(),
            saga_id,
            reservation_id: reservation_id.to_string(),
            transaction_id: transaction_id.to_string(),
        };
        self.call_started(saga_id, ORDER_SERVICE, STEP_ORDER).await;
        let result = self.gateway.create_order(&request).await;
        let order_id = self
            .observe(saga_id, STEP_ORDER, result)
            .await
            .map_err(|failure| SagaError::OrderCreationFailure(failure.message))?;

        let confirmed = self
            .coordinator
            .update_with_retry(saga_id, |s| {
                s.record_order(order_id.clone())?;
                s.transition_to(SagaState::SaleConfirmed)
            })
            .await?;
        self.audit
            .record(
                saga_id,
                SagaEventType::StateTransition,
                json!({ "from": SagaState::OrderConfirming, "to": SagaState::SaleConfirmed }),
            )
            .await;
        Ok(confirmed)
    }

    /// Compensates after a step failure and builds the failed outcome.
    ///
    /// When compensation cannot finish the saga stays in its current state
    /// for the timeout sweeper, and the outcome reports that state.
    async fn fail(&self, saga_id: SagaId, err: SagaError) -> SagaOutcome {
        tracing::warn!(%saga_id, kind = err.kind(), error = %err, "saga step failed");
        self.audit
            .record(
                saga_id,
                SagaEventType::Error,
                json!({ "kind": err.kind(), "message": err.to_string() }),
            )
            .await;

        let reason = err.user_message();
        if let Err(e) = self.compensation.compensate(saga_id, &reason).await {
            tracing::error!(%saga_id, error = %e, "compensation did not complete, left for the timeout sweeper");
        }

        // The stored message wins: a concurrent timeout may have finalized
        // the saga with its own reason.
        match self.repo.get(saga_id).await {
            Ok(Some(saga)) if !saga.is_terminal() => SagaOutcome {
                saga_id,
                state: saga.current_state(),
                message: format!("{reason} (compensation pending)"),
            },
            Ok(Some(saga)) => SagaOutcome::failed(
                saga_id,
                saga.error_message().map(str::to_string).unwrap_or(reason),
            ),
            _ => SagaOutcome::failed(saga_id, reason),
        }
    }

    pub async fn get_saga(&self, saga_id: SagaId) -> Result<SagaExecution> {
        Ok(self.repo.get_required(saga_id).await?)
    }

    /// Audit trail in creation order.
    pub async fn saga_events(&self, saga_id: SagaId) -> Result<Vec<SagaEventRecord>> {
        self.repo.get_required(saga_id).await?;
        Ok(self.repo.events_for_saga(saga_id).await?)
    }

    pub async fn statistics(&self) -> Result<SagaStatistics> {
        let counts = self.repo.state_counts().await?;
        let mut stats = SagaStatistics::default();
        for state in SagaState::ALL {
            let count = counts.get(&state).copied().unwrap_or(0);
            stats.by_state.insert(state.as_str().to_string(), count);
            stats.total += count;
            if state.is_active() {
                stats.active += count;
            }
        }
        Ok(stats)
    }
}
