//! Prometheus metrics endpoint and metric descriptions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::Unit;
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers help text for every metric the saga engine emits.
pub fn describe() {
    metrics::describe_counter!("saga_started_total", "Sagas persisted and started");
    metrics::describe_counter!("saga_completed_total", "Sagas that reached SALE_CONFIRMED");
    metrics::describe_counter!("saga_failed_total", "Sagas compensated into SALE_FAILED");
    metrics::describe_histogram!(
        "saga_duration_seconds",
        Unit::Seconds,
        "Wall time from saga start to its terminal state"
    );
    metrics::describe_counter!("saga_step_total", "Downstream step calls by step and outcome");
    metrics::describe_counter!("saga_compensation_total", "Compensation runs by outcome");
    metrics::describe_counter!("saga_timeouts_total", "Sagas failed by the timeout sweeper");
    metrics::describe_counter!(
        "saga_lock_conflicts_total",
        "Concurrency conflicts by kind (optimistic, serialization, race, limit)"
    );
    metrics::describe_counter!(
        "saga_call_retries_total",
        "Downstream call attempts retried after a transient failure"
    );
    metrics::describe_counter!(
        "circuit_breaker_fallback_total",
        "Fallback results produced instead of a downstream response"
    );
}

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
