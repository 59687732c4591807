//! In-memory notification service.

use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use messaging::{EventEnvelope, EventType, HandlerError};
use tokio::sync::RwLock;

use super::{Participant, Reply};
use crate::messages::{SendNotification, StepReply};
use crate::workflow::Service;

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<(SagaId, SendNotification)>,
    fail_on_send: bool,
}

/// Notification service that collects messages instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        self.state.write().await.fail_on_send = fail;
    }

    pub async fn sent_count(&self) -> usize {
        self.state.read().await.sent.len()
    }

    /// Messages sent for a saga.
    pub async fn sent_for(&self, saga_id: SagaId) -> Vec<SendNotification> {
        self.state
            .read()
            .await
            .sent
            .iter()
            .filter(|(id, _)| *id == saga_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl Participant for InMemoryNotificationService {
    fn service(&self) -> Service {
        Service::Notification
    }

    async fn execute(&self, command: &EventEnvelope) -> Result<Reply, HandlerError> {
        if command.event_type != EventType::SendNotification {
            return Err(HandlerError::unrecoverable(format!(
                "notification service cannot handle {}",
                command.event_type
            )));
        }

        let body: SendNotification = command.payload_as().map_err(HandlerError::unrecoverable)?;
        let mut state = self.state.write().await;

        if state.fail_on_send {
            return Ok(Reply::new(
                EventType::NotificationFailed,
                StepReply::failed("Notification channel unavailable"),
            ));
        }

        state.sent.push((command.saga_id, body));
        Ok(Reply::new(
            EventType::NotificationSent,
            StepReply::ok("Notification sent"),
        ))
    }
}
