use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, SagaId};

use crate::{Result, SagaState, SagaStatus, SagaStep, SagaStoreError};

/// Durable keyed storage of saga state.
///
/// A saga is written once by [`create`](SagaStore::create) and afterwards
/// only through [`compare_and_update`](SagaStore::compare_and_update).
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Creates a new saga in `Started` status waiting on `initial_step`.
    ///
    /// Fails with `AlreadyExists` if the id is already present.
    async fn create(
        &self,
        saga_id: SagaId,
        order_id: OrderId,
        initial_step: SagaStep,
        payload: serde_json::Value,
    ) -> Result<SagaState>;

    /// Loads a saga by id.
    async fn load(&self, saga_id: SagaId) -> Result<SagaState>;

    /// Replaces a saga if it still has the expected status and step.
    ///
    /// Returns the stored state on success. Reports `Conflict` if another
    /// writer got there first, and `NotFound` if the saga does not exist.
    async fn compare_and_update(
        &self,
        saga_id: SagaId,
        expected_status: SagaStatus,
        expected_step: Option<SagaStep>,
        new_state: SagaState,
    ) -> Result<SagaState>;

    /// Claims an unfinished saga for re-driving by moving `updated_at` to `now`.
    ///
    /// Succeeds only if the stored record still has the status, step and
    /// `updated_at` of `expected`, so of several claimants holding the same
    /// snapshot exactly one wins. The others get `StaleClaim`.
    async fn claim(&self, expected: &SagaState, now: DateTime<Utc>) -> Result<SagaState>;

    /// Returns unfinished sagas not written since `updated_before`.
    ///
    /// Oldest first, at most `limit` records.
    async fn find_stalled(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>>;
}

/// Validates a compare-and-update request before it reaches storage.
pub fn validate_update(
    saga_id: SagaId,
    expected_status: SagaStatus,
    expected_step: Option<SagaStep>,
    new_state: &SagaState,
) -> Result<()> {
    if new_state.saga_id != saga_id {
        return Err(SagaStoreError::InvalidUpdate {
            saga_id,
            reason: format!("new state belongs to saga {}", new_state.saga_id),
        });
    }

    if expected_status.is_terminal()
        || (expected_status == SagaStatus::Failed && expected_step.is_none())
        || !expected_status.can_transition_to(new_state.status)
    {
        return Err(SagaStoreError::InvalidTransition {
            saga_id,
            from: expected_status,
            to: new_state.status,
        });
    }

    if new_state.status.is_terminal() && new_state.current_step.is_some() {
        return Err(SagaStoreError::InvalidUpdate {
            saga_id,
            reason: format!("{} saga cannot await a step", new_state.status),
        });
    }

    if new_state.status.can_advance() && new_state.current_step.is_none() {
        return Err(SagaStoreError::InvalidUpdate {
            saga_id,
            reason: format!("{} saga must await a step", new_state.status),
        });
    }

    Ok(())
}

/// Rejects claims on sagas that have nothing left to re-drive.
pub fn validate_claim(expected: &SagaState) -> Result<()> {
    if expected.is_finished() {
        return Err(SagaStoreError::InvalidUpdate {
            saga_id: expected.saga_id,
            reason: format!("{} saga has no step to claim", expected.status),
        });
    }
    Ok(())
}
