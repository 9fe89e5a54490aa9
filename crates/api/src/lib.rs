//! HTTP API server for the sale saga.
//!
//! Provides REST endpoints to run sales and inspect sagas, timeouts and
//! circuit breakers, with structured logging (tracing) and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService, SagaConfig, SagaEngine,
};
use saga_store::SagaRepository;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::sales::AppState;

/// In-memory downstream services backing the default state.
#[derive(Debug, Clone, Default)]
pub struct DemoServices {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub order: InMemoryOrderService,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<R: SagaRepository + 'static>(
    state: Arc<AppState<R>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<R>))
        .route("/api/v1/saga/sales", post(routes::sales::create::<R>))
        .route("/api/v1/saga/sales/{saga_id}", get(routes::sales::get::<R>))
        .route(
            "/api/v1/saga/sales/{saga_id}/events",
            get(routes::sales::events::<R>),
        )
        .route("/api/v1/saga/statistics", get(routes::sales::statistics::<R>))
        .route("/api/v1/saga/timeouts", get(routes::sales::timeouts::<R>))
        .route("/api/v1/saga/timeouts/sweep", post(routes::sales::sweep::<R>))
        .route(
            "/api/v1/saga/circuit-breakers",
            get(routes::sales::circuit_breakers::<R>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state over `repo` with in-memory downstream
/// services.
pub fn create_default_state<R: SagaRepository + 'static>(
    repo: R,
    config: SagaConfig,
) -> (Arc<AppState<R>>, DemoServices) {
    let services = DemoServices::default();
    let engine = SagaEngine::new(
        Arc::new(repo),
        Arc::new(services.inventory.clone()),
        Arc::new(services.payment.clone()),
        Arc::new(services.order.clone()),
        config,
    );
    (Arc::new(AppState { engine }), services)
}
