//! Saga trigger and query endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{OrderId, SagaId};
use messaging::Broker;
use saga::{DiscardReason, Disposition, InventoryItem, Orchestrator, SagaContext};
use saga_store::{SagaState, SagaStore};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S, B> {
    pub orchestrator: Arc<Orchestrator<S, B>>,
}

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub saga_id: Option<String>,
    pub order_id: Option<String>,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub items: Vec<ItemRequest>,
    pub amount_cents: i64,
}

#[derive(Deserialize)]
pub struct ItemRequest {
    pub item_id: String,
    pub quantity: i64,
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub order_id: String,
    pub status: String,
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub context: serde_json::Value,
}

impl From<SagaState> for SagaResponse {
    fn from(state: SagaState) -> Self {
        Self {
            saga_id: state.saga_id.to_string(),
            order_id: state.order_id.to_string(),
            status: state.status.to_string(),
            current_step: state.current_step.map(|s| s.to_string()),
            started_at: state.started_at,
            updated_at: state.updated_at,
            context: state.payload,
        }
    }
}

// -- Handlers --

/// POST /sagas: Start a saga for an order.
#[tracing::instrument(skip(state, req))]
pub async fn start<S: SagaStore + 'static, B: Broker + 'static>(
    State(state): State<Arc<AppState<S, B>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaResponse>), ApiError> {
    let (saga_id, order_id, context) = validate(req)?;

    let saga = state
        .orchestrator
        .start_saga(saga_id, order_id, context)
        .await?;

    Ok((StatusCode::CREATED, Json(saga.into())))
}

/// GET /sagas/{id}: Current state of a saga.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + 'static, B: Broker + 'static>(
    State(state): State<Arc<AppState<S, B>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_id::<SagaId>("saga id", &id)?;
    let saga = state.orchestrator.saga(saga_id).await?;
    Ok(Json(saga.into()))
}

/// POST /sagas/{id}/cancel: Cancel a saga that has not started compensating.
#[tracing::instrument(skip(state, body))]
pub async fn cancel<S: SagaStore + 'static, B: Broker + 'static>(
    State(state): State<Arc<AppState<S, B>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_id::<SagaId>("saga id", &id)?;
    let req: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid cancel request: {e}")))?
    };

    match state.orchestrator.cancel(saga_id, req.reason).await? {
        Disposition::Cancelled => {
            let saga = state.orchestrator.saga(saga_id).await?;
            Ok(Json(saga.into()))
        }
        Disposition::Discarded(DiscardReason::UnknownSaga) => {
            Err(ApiError::NotFound(format!("Saga {saga_id} not found")))
        }
        Disposition::Discarded(DiscardReason::NotCancellable(status)) => Err(ApiError::Conflict(
            format!("Saga {saga_id} is {status} and cannot be cancelled"),
        )),
        other => Err(ApiError::Conflict(format!(
            "Saga {saga_id} was not cancelled: {other:?}"
        ))),
    }
}

fn validate(req: StartSagaRequest) -> Result<(SagaId, OrderId, SagaContext), ApiError> {
    let saga_id = match req.saga_id.as_deref() {
        Some(id) => parse_id("saga_id", id)?,
        None => SagaId::new(),
    };
    let order_id = match req.order_id.as_deref() {
        Some(id) => parse_id("order_id", id)?,
        None => OrderId::new(),
    };

    if req.customer_id.trim().is_empty() {
        return Err(ApiError::BadRequest("customer_id is required".to_string()));
    }
    if req.items.is_empty() {
        return Err(ApiError::BadRequest("At least one item is required".to_string()));
    }
    if req.amount_cents <= 0 {
        return Err(ApiError::BadRequest(format!(
            "amount_cents must be positive, got {}",
            req.amount_cents
        )));
    }

    let mut items = Vec::with_capacity(req.items.len());
    for item in &req.items {
        let quantity = u32::try_from(item.quantity)
            .ok()
            .filter(|q| *q > 0)
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Invalid quantity {} for item {}",
                    item.quantity, item.item_id
                ))
            })?;
        let item_id = uuid::Uuid::parse_str(&item.item_id)
            .map_err(|e| ApiError::BadRequest(format!("Invalid item_id: {e}")))?;
        items.push(InventoryItem { item_id, quantity });
    }

    let context = SagaContext {
        customer_id: req.customer_id,
        items,
        amount_cents: req.amount_cents.unsigned_abs(),
        ..SagaContext::default()
    };
    Ok((saga_id, order_id, context))
}

fn parse_id<T>(what: &str, value: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid {what}: {e}")))
}
