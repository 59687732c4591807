//! In-memory inventory service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use messaging::{EventEnvelope, EventType, HandlerError};
use tokio::sync::RwLock;

use super::{Participant, Reply};
use crate::messages::{InventoryItem, ReleaseInventory, ReserveInventory, StepReply};
use crate::workflow::Service;

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<SagaId, Vec<InventoryItem>>,
    released: usize,
    fail_on_reserve: bool,
    fail_on_release: bool,
}

/// Inventory service that keeps reservations in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes reserve commands answer with a failure.
    pub async fn set_fail_on_reserve(&self, fail: bool) {
        self.state.write().await.fail_on_reserve = fail;
    }

    /// Makes release commands answer with a failure.
    pub async fn set_fail_on_release(&self, fail: bool) {
        self.state.write().await.fail_on_release = fail;
    }

    /// Number of reservations currently held.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    pub async fn has_reservation(&self, saga_id: SagaId) -> bool {
        self.state.read().await.reservations.contains_key(&saga_id)
    }

    /// Number of reservations released so far.
    pub async fn released_count(&self) -> usize {
        self.state.read().await.released
    }
}

#[async_trait]
impl Participant for InMemoryInventoryService {
    fn service(&self) -> Service {
        Service::Inventory
    }

    async fn execute(&self, command: &EventEnvelope) -> Result<Reply, HandlerError> {
        match command.event_type {
            EventType::ReserveInventory => {
                let body: ReserveInventory =
                    command.payload_as().map_err(HandlerError::unrecoverable)?;
                let mut state = self.state.write().await;

                if state.fail_on_reserve {
                    return Ok(Reply::new(
                        EventType::InventoryFailed,
                        StepReply::failed("Insufficient stock"),
                    ));
                }
                if body.items.is_empty() {
                    return Ok(Reply::new(
                        EventType::InventoryFailed,
                        StepReply::failed("No items to reserve"),
                    ));
                }

                state.reservations.insert(command.saga_id, body.items);
                Ok(Reply::new(
                    EventType::InventoryReserved,
                    StepReply::ok("Inventory reserved"),
                ))
            }
            EventType::ReleaseInventory => {
                let _: ReleaseInventory =
                    command.payload_as().map_err(HandlerError::unrecoverable)?;
                let mut state = self.state.write().await;

                if state.fail_on_release {
                    return Ok(Reply::new(
                        EventType::InventoryReleaseFailed,
                        StepReply::failed("Warehouse unavailable"),
                    ));
                }

                if state.reservations.remove(&command.saga_id).is_some() {
                    state.released += 1;
                }
                Ok(Reply::new(
                    EventType::InventoryReleased,
                    StepReply::ok("Inventory released"),
                ))
            }
            other => Err(HandlerError::unrecoverable(format!(
                "inventory service cannot handle {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderId;
    use uuid::Uuid;

    fn reserve(saga_id: SagaId) -> EventEnvelope {
        EventEnvelope::with_payload(
            EventType::ReserveInventory,
            saga_id,
            OrderId::new(),
            &ReserveInventory {
                items: vec![InventoryItem {
                    item_id: Uuid::new_v4(),
                    quantity: 3,
                }],
            },
        )
        .unwrap()
    }

    fn release(saga_id: SagaId) -> EventEnvelope {
        EventEnvelope::with_payload(
            EventType::ReleaseInventory,
            saga_id,
            OrderId::new(),
            &ReleaseInventory { items: vec![] },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();
        let saga_id = SagaId::new();

        let reply = service.execute(&reserve(saga_id)).await.unwrap();
        assert_eq!(reply.event_type, EventType::InventoryReserved);
        assert!(service.has_reservation(saga_id).await);

        let reply = service.execute(&release(saga_id)).await.unwrap();
        assert_eq!(reply.event_type, EventType::InventoryReleased);
        assert_eq!(service.reservation_count().await, 0);
        assert_eq!(service.released_count().await, 1);
    }

    #[tokio::test]
    async fn test_fail_on_reserve() {
        let service = InMemoryInventoryService::new();
        service.set_fail_on_reserve(true).await;

        let reply = service.execute(&reserve(SagaId::new())).await.unwrap();
        assert_eq!(reply.event_type, EventType::InventoryFailed);
        assert!(!reply.body.success);
        assert_eq!(service.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_fail_on_release_keeps_reservation() {
        let service = InMemoryInventoryService::new();
        let saga_id = SagaId::new();
        service.execute(&reserve(saga_id)).await.unwrap();
        service.set_fail_on_release(true).await;

        let reply = service.execute(&release(saga_id)).await.unwrap();
        assert_eq!(reply.event_type, EventType::InventoryReleaseFailed);
        assert!(service.has_reservation(saga_id).await);
    }

    #[tokio::test]
    async fn test_rejects_other_commands() {
        let service = InMemoryInventoryService::new();
        let command = EventEnvelope::new(
            EventType::ProcessPayment,
            SagaId::new(),
            OrderId::new(),
            serde_json::json!({}),
        );
        assert!(matches!(
            service.execute(&command).await,
            Err(HandlerError::Unrecoverable(_))
        ));
    }
}
