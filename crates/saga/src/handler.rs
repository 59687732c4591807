//! Connects the orchestrator to a consumer.

use std::sync::Arc;

use async_trait::async_trait;
use messaging::{Broker, EventEnvelope, HandlerError, Record, RecordHandler};
use saga_store::SagaStore;

use crate::orchestrator::Orchestrator;

/// Decodes records from the orders and reply topics and hands them to the
/// orchestrator.
///
/// Undecodable records and unexpected event types are unrecoverable and
/// end up on the dead-letter topic. Store and publish failures are retried.
pub struct SagaRecordHandler<S, B> {
    orchestrator: Arc<Orchestrator<S, B>>,
}

impl<S, B> SagaRecordHandler<S, B> {
    pub fn new(orchestrator: Arc<Orchestrator<S, B>>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl<S: SagaStore, B: Broker> RecordHandler for SagaRecordHandler<S, B> {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        let envelope = EventEnvelope::decode(&record.payload, &record.headers)
            .map_err(HandlerError::unrecoverable)?;

        match self.orchestrator.handle_envelope(&envelope).await {
            Ok(disposition) => {
                tracing::debug!(
                    saga_id = %envelope.saga_id,
                    event_type = %envelope.event_type,
                    ?disposition,
                    "Record handled"
                );
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(HandlerError::retryable(e)),
            Err(e) => Err(HandlerError::unrecoverable(e)),
        }
    }
}
