//! Saga error types.

use common::SagaId;
use messaging::{EnvelopeError, EventType, PublishError};
use saga_store::{SagaStep, SagaStoreError};
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// Publishing a command or reply failed.
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// A message could not be decoded.
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// The stored saga context is not valid.
    #[error("Invalid saga context: {0}")]
    Context(#[source] serde_json::Error),

    /// An event arrived on a path that does not handle it.
    #[error("Unexpected event type: {0}")]
    UnexpectedEvent(EventType),

    /// A saga references a step missing from the workflow table.
    #[error("Step {0} is not part of the workflow")]
    UnknownStep(SagaStep),

    /// The workflow table has no steps.
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    /// Concurrent writers kept moving the saga.
    #[error("Saga {saga_id} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { saga_id: SagaId, attempts: u32 },
}

impl SagaError {
    /// Returns true if handling the same message again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Store(e) => matches!(
                e,
                SagaStoreError::Database(_) | SagaStoreError::Conflict { .. }
            ),
            SagaError::Publish(PublishError::Failed { source, .. }) => source.is_retryable(),
            SagaError::ConflictRetriesExhausted { .. } => true,
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
