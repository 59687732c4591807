//! Payloads carried in envelopes. Amounts are integer cents.

use common::OrderId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_id: Uuid,
    pub quantity: u32,
}

/// Body of `RESERVE_INVENTORY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveInventory {
    pub items: Vec<InventoryItem>,
}

/// Body of `RELEASE_INVENTORY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInventory {
    pub items: Vec<InventoryItem>,
}

/// Body of `PROCESS_PAYMENT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessPayment {
    pub amount_cents: u64,
    pub customer_id: String,
}

/// Body of `REFUND_PAYMENT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundPayment {
    #[serde(default)]
    pub payment_id: Option<String>,
    pub amount_cents: u64,
}

/// Body of `SEND_NOTIFICATION`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendNotification {
    pub customer_id: String,
    pub order_id: OrderId,
    pub message: String,
}

/// Body of every participant reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

impl StepReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payment_id: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payment_id: None,
        }
    }
}

/// Body of `ORDER_PLACED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub customer_id: String,
    pub items: Vec<InventoryItem>,
    pub amount_cents: u64,
}

/// Body of `ORDER_CANCELLED`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelled {
    #[serde(default)]
    pub reason: Option<String>,
}
