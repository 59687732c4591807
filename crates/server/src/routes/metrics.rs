//! Prometheus metrics endpoint and metric descriptions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers help text for the saga metrics. Call once after the recorder
/// is installed.
pub fn describe() {
    describe_counter!("saga_started_total", "Sagas created");
    describe_counter!("saga_completed_total", "Sagas that completed every step");
    describe_counter!("saga_compensated_total", "Sagas fully compensated after a failure");
    describe_counter!("saga_failed_total", "Sagas whose compensation did not fully succeed");
    describe_counter!("saga_cancelled_total", "Sagas cancelled before completion");
    describe_counter!("saga_replies_total", "Participant replies received, by step and outcome");
    describe_counter!(
        "saga_replies_discarded_total",
        "Messages that did not change any saga, by reason"
    );
    describe_counter!("saga_store_conflicts_total", "Compare-and-update conflicts");
    describe_counter!(
        "saga_store_claims_lost_total",
        "Reconciliation claims lost to a concurrent writer"
    );
    describe_counter!("saga_publish_gaps_total", "Commands left unpublished after a transition");
    describe_counter!("saga_reconciled_total", "Commands re-issued for stalled sagas");
    describe_histogram!(
        "saga_duration_seconds",
        Unit::Seconds,
        "Time from saga start to its final status"
    );
    describe_counter!("publisher_attempts_total", "Produce attempts, by topic");
    describe_counter!("publisher_failures_total", "Records given up on, by topic");
    describe_counter!("consumer_records_total", "Records handled, by topic");
    describe_counter!("consumer_handler_retries_total", "In-place handler retries");
    describe_counter!("consumer_dead_lettered_total", "Records moved to the dead-letter topic");
}

/// GET /metrics: Returns Prometheus-formatted metrics.
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
