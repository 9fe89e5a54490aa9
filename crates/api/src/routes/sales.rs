//! Sale saga endpoints.

use std::str::FromStr;
use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{Money, SagaId};
use saga::{
    ApproachingTimeout, CircuitBreakerSnapshot, ConcurrencyReport, ConcurrencyStats, SagaEngine,
    SagaOutcome, SagaStatistics, SaleRequest, StateBudget, SweepReport,
};
use saga_store::{SagaEventRecord, SagaExecution, SagaRepository};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<R> {
    pub engine: SagaEngine<R>,
}

// -- Request types --

#[derive(Deserialize)]
pub struct SaleRequestBody {
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount_cents: i64,
    pub payment_method: Option<String>,
}

impl SaleRequestBody {
    fn into_request(self) -> SaleRequest {
        let mut request = SaleRequest::new(
            self.customer_id,
            self.product_id,
            self.quantity,
            Money::from_cents(self.amount_cents),
        );
        if let Some(method) = self.payment_method.filter(|m| !m.trim().is_empty()) {
            request.payment_method = method;
        }
        request
    }
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub saga_id: String,
    pub state: String,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: u32,
    pub amount_cents: i64,
    pub payment_method: String,
    pub stock_reservation_id: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub order_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl From<SagaExecution> for SagaStatusResponse {
    fn from(saga: SagaExecution) -> Self {
        Self {
            saga_id: saga.saga_id().to_string(),
            state: saga.current_state().to_string(),
            customer_id: saga.customer_id().to_string(),
            product_id: saga.product_id().to_string(),
            quantity: saga.quantity(),
            amount_cents: saga.amount().cents(),
            payment_method: saga.payment_method().to_string(),
            stock_reservation_id: saga.stock_reservation_id().map(str::to_string),
            payment_transaction_id: saga.payment_transaction_id().map(str::to_string),
            order_id: saga.order_id().map(str::to_string),
            error_message: saga.error_message().map(str::to_string),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
            version: saga.version().as_i64(),
        }
    }
}

#[derive(Serialize)]
pub struct SagaEventResponse {
    pub sequence: i64,
    pub event_id: uuid::Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<SagaEventRecord> for SagaEventResponse {
    fn from(event: SagaEventRecord) -> Self {
        Self {
            sequence: event.sequence,
            event_id: event.event_id.as_uuid(),
            event_type: event.event_type.to_string(),
            payload: event.payload,
            created_at: event.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct StatisticsResponse {
    pub sagas: SagaStatistics,
    pub locks: ConcurrencyStats,
    pub concurrency: ConcurrencyReport,
}

#[derive(Serialize)]
pub struct TimeoutsResponse {
    pub budgets: Vec<StateBudget>,
    pub warning_ratio: f64,
    pub approaching: Vec<ApproachingTimeout>,
}

fn parse_saga_id(raw: &str) -> Result<SagaId, ApiError> {
    SagaId::from_str(raw).map_err(|e| ApiError::BadRequest(format!("Invalid saga_id: {e}")))
}

// -- Handlers --

/// POST /api/v1/saga/sales: run a sale to completion.
///
/// Confirmed sales return 200, failed sagas 422 with the same body.
#[tracing::instrument(skip(state, body))]
pub async fn create<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
    body: Result<Json<SaleRequestBody>, JsonRejection>,
) -> Result<(StatusCode, Json<SagaOutcome>), ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = body.into_request();
    request.validate()?;

    let outcome = state.engine.orchestrator().execute_sale(request).await;
    let status = if outcome.is_confirmed() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(outcome)))
}

/// GET /api/v1/saga/sales/{saga_id}: saga status.
#[tracing::instrument(skip(state))]
pub async fn get<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(saga_id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let saga_id = parse_saga_id(&saga_id)?;
    let saga = state.engine.orchestrator().get_saga(saga_id).await?;
    Ok(Json(saga.into()))
}

/// GET /api/v1/saga/sales/{saga_id}/events: audit trail in creation order.
#[tracing::instrument(skip(state))]
pub async fn events<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(saga_id): Path<String>,
) -> Result<Json<Vec<SagaEventResponse>>, ApiError> {
    let saga_id = parse_saga_id(&saga_id)?;
    let events = state.engine.orchestrator().saga_events(saga_id).await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

/// GET /api/v1/saga/statistics
pub async fn statistics<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
) -> Result<Json<StatisticsResponse>, ApiError> {
    let coordinator = state.engine.coordinator();
    Ok(Json(StatisticsResponse {
        sagas: state.engine.orchestrator().statistics().await?,
        locks: coordinator.statistics(),
        concurrency: coordinator.concurrency_report().await?,
    }))
}

/// GET /api/v1/saga/timeouts
pub async fn timeouts<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
) -> Result<Json<TimeoutsResponse>, ApiError> {
    let sweeper = state.engine.sweeper();
    Ok(Json(TimeoutsResponse {
        budgets: sweeper.timeout_budgets(),
        warning_ratio: sweeper.config().warning_ratio,
        approaching: sweeper.approaching_timeout().await?,
    }))
}

/// POST /api/v1/saga/timeouts/sweep: run one sweep now.
#[tracing::instrument(skip(state))]
pub async fn sweep<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
) -> Result<Json<SweepReport>, ApiError> {
    let report = state.engine.sweeper().sweep().await?;
    tracing::info!(timed_out = report.timed_out.len(), "manual timeout sweep");
    Ok(Json(report))
}

/// GET /api/v1/saga/circuit-breakers
pub async fn circuit_breakers<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
) -> Json<Vec<CircuitBreakerSnapshot>> {
    Json(state.engine.gateway().breaker_snapshots())
}
