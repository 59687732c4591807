use common::OrderId;
use messaging::EventType;
use saga_store::SagaStep;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;
use crate::messages::{
    InventoryItem, OrderPlaced, ProcessPayment, RefundPayment, ReleaseInventory, ReserveInventory,
    SendNotification, StepReply,
};
use crate::workflow::StepDefinition;

/// A compensation command that was answered with a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: SagaStep,
    pub reason: String,
}

/// Context accumulated across the steps of one saga.
///
/// Stored as the saga record's payload. Everything a later command needs,
/// such as the payment id a refund refers to, is captured here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaContext {
    pub customer_id: String,
    pub items: Vec<InventoryItem>,
    pub amount_cents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<SagaStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compensation_failures: Vec<CompensationFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl From<OrderPlaced> for SagaContext {
    fn from(order: OrderPlaced) -> Self {
        Self {
            customer_id: order.customer_id,
            items: order.items,
            amount_cents: order.amount_cents,
            ..Self::default()
        }
    }
}

impl SagaContext {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, SagaError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).map_err(SagaError::Context)
    }

    pub fn to_value(&self) -> Result<serde_json::Value, SagaError> {
        serde_json::to_value(self).map_err(SagaError::Context)
    }

    /// Builds the command body for `definition`.
    pub fn command_payload(
        &self,
        definition: &StepDefinition,
        order_id: OrderId,
    ) -> Result<serde_json::Value, SagaError> {
        let payload = match definition.command {
            EventType::ReserveInventory => serde_json::to_value(ReserveInventory {
                items: self.items.clone(),
            }),
            EventType::ReleaseInventory => serde_json::to_value(ReleaseInventory {
                items: self.items.clone(),
            }),
            EventType::ProcessPayment => serde_json::to_value(ProcessPayment {
                amount_cents: self.amount_cents,
                customer_id: self.customer_id.clone(),
            }),
            EventType::RefundPayment => serde_json::to_value(RefundPayment {
                payment_id: self.payment_id.clone(),
                amount_cents: self.amount_cents,
            }),
            EventType::SendNotification => serde_json::to_value(SendNotification {
                customer_id: self.customer_id.clone(),
                order_id,
                message: format!("Order {order_id} confirmed"),
            }),
            other => return Err(SagaError::UnexpectedEvent(other)),
        };
        payload.map_err(SagaError::Context)
    }

    /// Records what a successful reply for `step` tells us.
    pub fn absorb(&mut self, step: SagaStep, reply: &StepReply) {
        if step == SagaStep::ProcessPayment && reply.payment_id.is_some() {
            self.payment_id = reply.payment_id.clone();
        }
    }
}
