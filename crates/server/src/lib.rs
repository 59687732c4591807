//! Saga orchestration server.
//!
//! Exposes HTTP endpoints to start, inspect and cancel sagas, runs the
//! orchestrator, participants and reconciler as background workers, and
//! reports structured logs (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod workers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use messaging::Broker;
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError, ServiceGroups, StoreBackend};
pub use routes::health::HealthInfo;
pub use routes::sagas::AppState;
pub use workers::{Participants, Workers};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, B>(
    state: Arc<AppState<S, B>>,
    health: HealthInfo,
    metrics_handle: PrometheusHandle,
) -> Router
where
    S: SagaStore + 'static,
    B: Broker + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    let health_router = Router::new()
        .route("/health", get(routes::health::check))
        .with_state(Arc::new(health));

    Router::new()
        .route("/sagas", post(routes::sagas::start::<S, B>))
        .route("/sagas/{id}", get(routes::sagas::get::<S, B>))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel::<S, B>))
        .with_state(state)
        .merge(health_router)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
