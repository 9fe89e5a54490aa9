//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_store::{SagaRepository, SagaRepositoryExt};
use serde::Serialize;

use super::sales::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sagas: u64,
}

/// GET /health: returns system health status.
pub async fn check<R: SagaRepository + 'static>(
    State(state): State<Arc<AppState<R>>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let active_sagas = state
        .engine
        .repository()
        .active_count()
        .await
        .map_err(|e| ApiError::Internal(format!("saga store unavailable: {e}")))?;
    Ok(Json(HealthResponse {
        status: "ok",
        active_sagas,
    }))
}
