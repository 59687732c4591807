use chrono::{DateTime, Utc};
use common::SagaId;
use thiserror::Error;

use crate::{ParseError, SagaStatus, SagaStep};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// A saga with this id was already created.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// No saga with this id exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The stored record no longer matches the expected status and step.
    ///
    /// The caller should re-read the saga and decide whether its update is a
    /// no-op or must be retried.
    #[error(
        "Conflict for saga {saga_id}: expected {expected_status}/{}, found {actual_status}/{}",
        step_name(.expected_step),
        step_name(.actual_step)
    )]
    Conflict {
        saga_id: SagaId,
        expected_status: SagaStatus,
        expected_step: Option<SagaStep>,
        actual_status: SagaStatus,
        actual_step: Option<SagaStep>,
    },

    /// A reconciliation claim lost to another writer.
    ///
    /// The record was written after the claimant read it, so the claimant
    /// must not act on its snapshot.
    #[error(
        "Stale claim for saga {saga_id}: read at {expected_updated_at}, now at {actual_updated_at}"
    )]
    StaleClaim {
        saga_id: SagaId,
        expected_updated_at: DateTime<Utc>,
        actual_updated_at: DateTime<Utc>,
    },

    /// The state machine does not allow this status change.
    #[error("Invalid transition for saga {saga_id}: {from} -> {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// The new state is malformed for its status.
    #[error("Invalid update for saga {saga_id}: {reason}")]
    InvalidUpdate { saga_id: SagaId, reason: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored status or step could not be parsed.
    #[error("Corrupt saga record: {0}")]
    Corrupt(#[from] ParseError),
}

fn step_name(step: &Option<SagaStep>) -> &'static str {
    step.as_ref().map_or("NONE", SagaStep::as_str)
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
