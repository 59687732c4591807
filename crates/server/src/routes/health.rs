//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Static facts about this process reported by the health check.
#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub region: String,
    pub started_at: DateTime<Utc>,
}

impl HealthInfo {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub region: String,
    pub uptime_seconds: i64,
}

/// GET /health: Returns process health status.
pub async fn check(State(info): State<Arc<HealthInfo>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        region: info.region.clone(),
        uptime_seconds: (Utc::now() - info.started_at).num_seconds(),
    })
}
