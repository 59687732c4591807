use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, SagaId};
use tokio::sync::RwLock;

use crate::{
    Result, SagaState, SagaStatus, SagaStep, SagaStoreError,
    store::{SagaStore, validate_claim, validate_update},
};

/// In-memory saga store.
///
/// Provides the same compare-and-update semantics as the PostgreSQL store
/// and is used by tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<SagaId, SagaState>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Removes all sagas.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
    }

    /// Writes a saga without any checks.
    ///
    /// Lets tests set up a record as if a previous process had left it.
    pub async fn insert_raw(&self, state: SagaState) {
        self.sagas.write().await.insert(state.saga_id, state);
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(
        &self,
        saga_id: SagaId,
        order_id: OrderId,
        initial_step: SagaStep,
        payload: serde_json::Value,
    ) -> Result<SagaState> {
        let mut sagas = self.sagas.write().await;
        if sagas.contains_key(&saga_id) {
            return Err(SagaStoreError::AlreadyExists(saga_id));
        }

        let state = SagaState::new(saga_id, order_id, initial_step, payload);
        sagas.insert(saga_id, state.clone());
        Ok(state)
    }

    async fn load(&self, saga_id: SagaId) -> Result<SagaState> {
        self.sagas
            .read()
            .await
            .get(&saga_id)
            .cloned()
            .ok_or(SagaStoreError::NotFound(saga_id))
    }

    async fn compare_and_update(
        &self,
        saga_id: SagaId,
        expected_status: SagaStatus,
        expected_step: Option<SagaStep>,
        new_state: SagaState,
    ) -> Result<SagaState> {
        validate_update(saga_id, expected_status, expected_step, &new_state)?;

        let mut sagas = self.sagas.write().await;
        let current = sagas
            .get_mut(&saga_id)
            .ok_or(SagaStoreError::NotFound(saga_id))?;

        if current.status != expected_status || current.current_step != expected_step {
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(SagaStoreError::Conflict {
                saga_id,
                expected_status,
                expected_step,
                actual_status: current.status,
                actual_step: current.current_step,
            });
        }

        // Identity columns are fixed at creation.
        let stored = SagaState {
            order_id: current.order_id,
            started_at: current.started_at,
            ..new_state
        };
        *current = stored.clone();
        Ok(stored)
    }

    async fn claim(&self, expected: &SagaState, now: DateTime<Utc>) -> Result<SagaState> {
        validate_claim(expected)?;

        let mut sagas = self.sagas.write().await;
        let current = sagas
            .get_mut(&expected.saga_id)
            .ok_or(SagaStoreError::NotFound(expected.saga_id))?;

        if current.status != expected.status
            || current.current_step != expected.current_step
            || current.updated_at != expected.updated_at
        {
            metrics::counter!("saga_store_claims_lost_total").increment(1);
            return Err(SagaStoreError::StaleClaim {
                saga_id: expected.saga_id,
                expected_updated_at: expected.updated_at,
                actual_updated_at: current.updated_at,
            });
        }

        current.updated_at = now;
        Ok(current.clone())
    }

    async fn find_stalled(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>> {
        let sagas = self.sagas.read().await;
        let mut stalled: Vec<SagaState> = sagas
            .values()
            .filter(|s| !s.is_finished() && s.updated_at < updated_before)
            .cloned()
            .collect();

        stalled.sort_by_key(|s| s.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }
}
