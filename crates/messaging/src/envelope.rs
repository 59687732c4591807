//! The canonical message wrapper exchanged on every topic.
//!
//! On the wire the record value carries only the JSON payload. Event type,
//! identifiers and timestamp travel in a separate `metadata` header so that
//! routing infrastructure can inspect them without parsing the body.

use chrono::{DateTime, Utc};
use common::{EventId, OrderId, SagaId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::broker::Header;
use crate::error::EnvelopeError;

/// Name of the record header carrying envelope metadata.
pub const METADATA_HEADER: &str = "metadata";

/// Current metadata schema version. Decoders reject anything newer.
pub const SCHEMA_VERSION: u32 = 1;

/// Every message kind the saga exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Commands to participants.
    ReserveInventory,
    ReleaseInventory,
    ProcessPayment,
    RefundPayment,
    SendNotification,

    // Replies from participants.
    InventoryReserved,
    InventoryFailed,
    InventoryReleased,
    InventoryReleaseFailed,
    PaymentProcessed,
    PaymentFailed,
    PaymentRefunded,
    PaymentRefundFailed,
    NotificationSent,
    NotificationFailed,

    // Order triggers.
    OrderPlaced,
    OrderCancelled,
}

impl EventType {
    /// Returns true for commands sent to a participant.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            EventType::ReserveInventory
                | EventType::ReleaseInventory
                | EventType::ProcessPayment
                | EventType::RefundPayment
                | EventType::SendNotification
        )
    }

    /// Returns true for replies emitted by a participant.
    pub fn is_reply(&self) -> bool {
        !self.is_command() && !matches!(self, EventType::OrderPlaced | EventType::OrderCancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ReserveInventory => "RESERVE_INVENTORY",
            EventType::ReleaseInventory => "RELEASE_INVENTORY",
            EventType::ProcessPayment => "PROCESS_PAYMENT",
            EventType::RefundPayment => "REFUND_PAYMENT",
            EventType::SendNotification => "SEND_NOTIFICATION",
            EventType::InventoryReserved => "INVENTORY_RESERVED",
            EventType::InventoryFailed => "INVENTORY_FAILED",
            EventType::InventoryReleased => "INVENTORY_RELEASED",
            EventType::InventoryReleaseFailed => "INVENTORY_RELEASE_FAILED",
            EventType::PaymentProcessed => "PAYMENT_PROCESSED",
            EventType::PaymentFailed => "PAYMENT_FAILED",
            EventType::PaymentRefunded => "PAYMENT_REFUNDED",
            EventType::PaymentRefundFailed => "PAYMENT_REFUND_FAILED",
            EventType::NotificationSent => "NOTIFICATION_SENT",
            EventType::NotificationFailed => "NOTIFICATION_FAILED",
            EventType::OrderPlaced => "ORDER_PLACED",
            EventType::OrderCancelled => "ORDER_CANCELLED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed message with its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: EventType,
    /// Unique per physical message; a redelivery keeps the same id.
    pub event_id: EventId,
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Metadata block carried in the [`METADATA_HEADER`] header.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordMetadata {
    version: u32,
    event_type: EventType,
    event_id: EventId,
    saga_id: SagaId,
    order_id: OrderId,
    timestamp: DateTime<Utc>,
}

/// An envelope in its wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedEnvelope {
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
}

impl EventEnvelope {
    /// Creates an envelope with a fresh event id, stamped now.
    pub fn new(
        event_type: EventType,
        saga_id: SagaId,
        order_id: OrderId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            event_id: EventId::new(),
            saga_id,
            order_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Creates an envelope from a serializable payload.
    pub fn with_payload<T: Serialize>(
        event_type: EventType,
        saga_id: SagaId,
        order_id: OrderId,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(payload).map_err(EnvelopeError::Payload)?;
        Ok(Self::new(event_type, saga_id, order_id, payload))
    }

    /// Deserializes the payload. Unknown fields are ignored.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone()).map_err(EnvelopeError::Payload)
    }

    /// Encodes the envelope into a record value and headers.
    pub fn encode(&self) -> Result<EncodedEnvelope, EnvelopeError> {
        let metadata = RecordMetadata {
            version: SCHEMA_VERSION,
            event_type: self.event_type,
            event_id: self.event_id,
            saga_id: self.saga_id,
            order_id: self.order_id,
            timestamp: self.timestamp,
        };

        Ok(EncodedEnvelope {
            payload: serde_json::to_vec(&self.payload).map_err(EnvelopeError::Encode)?,
            headers: vec![Header::new(
                METADATA_HEADER,
                serde_json::to_vec(&metadata).map_err(EnvelopeError::Encode)?,
            )],
        })
    }

    /// Decodes an envelope from a record value and its headers.
    pub fn decode(payload: &[u8], headers: &[Header]) -> Result<Self, EnvelopeError> {
        let raw = headers
            .iter()
            .find(|h| h.key == METADATA_HEADER)
            .ok_or_else(|| EnvelopeError::decode("missing metadata header"))?;

        let metadata: RecordMetadata = serde_json::from_slice(&raw.value)
            .map_err(|e| EnvelopeError::decode(format!("invalid metadata: {e}")))?;

        if metadata.version > SCHEMA_VERSION {
            return Err(EnvelopeError::decode(format!(
                "unsupported schema version {}",
                metadata.version
            )));
        }

        let payload = serde_json::from_slice(payload)
            .map_err(|e| EnvelopeError::decode(format!("invalid payload: {e}")))?;

        Ok(Self {
            event_type: metadata.event_type,
            event_id: metadata.event_id,
            saga_id: metadata.saga_id,
            order_id: metadata.order_id,
            timestamp: metadata.timestamp,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> EventEnvelope {
        EventEnvelope::new(
            EventType::InventoryReserved,
            SagaId::new(),
            OrderId::new(),
            json!({"success": true, "message": "reserved"}),
        )
    }

    #[test]
    fn decode_inverts_encode() {
        let envelope = sample();
        let encoded = envelope.encode().unwrap();
        let decoded = EventEnvelope::decode(&encoded.payload, &encoded.headers).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn metadata_travels_outside_the_body() {
        let envelope = sample();
        let encoded = envelope.encode().unwrap();

        let body: serde_json::Value = serde_json::from_slice(&encoded.payload).unwrap();
        assert_eq!(body, envelope.payload);
        assert!(body.get("saga_id").is_none());

        let header = &encoded.headers[0];
        assert_eq!(header.key, METADATA_HEADER);
        let metadata: serde_json::Value = serde_json::from_slice(&header.value).unwrap();
        assert_eq!(metadata["event_type"], "INVENTORY_RESERVED");
        assert_eq!(metadata["version"], SCHEMA_VERSION);
        assert_eq!(metadata["saga_id"], envelope.saga_id.to_string());
    }

    #[test]
    fn unknown_metadata_fields_are_ignored() {
        let envelope = sample();
        let mut metadata: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap().headers[0].value).unwrap();
        metadata["trace_id"] = json!("abc");

        let headers = vec![Header::new(
            METADATA_HEADER,
            serde_json::to_vec(&metadata).unwrap(),
        )];
        let payload = serde_json::to_vec(&envelope.payload).unwrap();
        let decoded = EventEnvelope::decode(&payload, &headers).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn payload_ignores_unknown_fields() {
        #[derive(Deserialize)]
        struct Reply {
            success: bool,
        }

        let envelope = sample();
        let reply: Reply = envelope.payload_as().unwrap();
        assert!(reply.success);
    }

    #[test]
    fn missing_metadata_is_a_decode_error() {
        let err = EventEnvelope::decode(b"{}", &[]).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode { .. }));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let encoded = sample().encode().unwrap();
        let err = EventEnvelope::decode(b"not json", &encoded.headers).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode { .. }));
    }

    #[test]
    fn unknown_event_type_is_a_decode_error() {
        let encoded = sample().encode().unwrap();
        let mut metadata: serde_json::Value =
            serde_json::from_slice(&encoded.headers[0].value).unwrap();
        metadata["event_type"] = json!("CONFIRM_ORDER");
        let headers = vec![Header::new(
            METADATA_HEADER,
            serde_json::to_vec(&metadata).unwrap(),
        )];

        let err = EventEnvelope::decode(&encoded.payload, &headers).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode { .. }));
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let encoded = sample().encode().unwrap();
        let mut metadata: serde_json::Value =
            serde_json::from_slice(&encoded.headers[0].value).unwrap();
        metadata["version"] = json!(SCHEMA_VERSION + 1);
        let headers = vec![Header::new(
            METADATA_HEADER,
            serde_json::to_vec(&metadata).unwrap(),
        )];

        let err = EventEnvelope::decode(&encoded.payload, &headers).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version"));
    }

    #[test]
    fn event_type_classification() {
        assert!(EventType::RefundPayment.is_command());
        assert!(!EventType::RefundPayment.is_reply());
        assert!(EventType::PaymentRefundFailed.is_reply());
        assert!(!EventType::OrderPlaced.is_command());
        assert!(!EventType::OrderPlaced.is_reply());
        assert_eq!(
            serde_json::to_string(&EventType::InventoryReleaseFailed).unwrap(),
            "\"INVENTORY_RELEASE_FAILED\""
        );
    }
}
