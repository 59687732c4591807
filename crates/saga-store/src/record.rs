use chrono::{DateTime, Utc};
use common::{OrderId, SagaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::SagaStatus;

/// A step a saga can be waiting on.
///
/// Forward steps and compensation steps share one namespace so a stored
/// `current_step` always names exactly one outstanding command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    ReserveInventory,
    ProcessPayment,
    SendNotification,
    CompensatePayment,
    CompensateInventory,
}

impl SagaStep {
    /// All steps.
    pub const ALL: [SagaStep; 5] = [
        SagaStep::ReserveInventory,
        SagaStep::ProcessPayment,
        SagaStep::SendNotification,
        SagaStep::CompensatePayment,
        SagaStep::CompensateInventory,
    ];

    /// Returns the step name as stored and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::ReserveInventory => "RESERVE_INVENTORY",
            SagaStep::ProcessPayment => "PROCESS_PAYMENT",
            SagaStep::SendNotification => "SEND_NOTIFICATION",
            SagaStep::CompensatePayment => "COMPENSATE_PAYMENT",
            SagaStep::CompensateInventory => "COMPENSATE_INVENTORY",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStep {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| ParseError::new("saga step", s))
    }
}

/// A stored value could not be parsed back into its enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl ParseError {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// The durable record of one saga.
///
/// Created once with status `Started`, then replaced only through
/// compare-and-update. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    /// Primary key.
    pub saga_id: SagaId,

    /// The order being fulfilled.
    pub order_id: OrderId,

    /// Where the saga is in its state machine.
    pub status: SagaStatus,

    /// The step whose reply is awaited, or `None` once finished.
    pub current_step: Option<SagaStep>,

    /// Opaque context accumulated across steps.
    pub payload: serde_json::Value,

    /// When the saga was created.
    pub started_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl SagaState {
    /// Creates a freshly started saga waiting on `initial_step`.
    pub fn new(
        saga_id: SagaId,
        order_id: OrderId,
        initial_step: SagaStep,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            order_id,
            status: SagaStatus::Started,
            current_step: Some(initial_step),
            payload,
            started_at: now,
            updated_at: now,
        }
    }

    /// Returns true if no further reply can change this saga.
    ///
    /// Covers terminal statuses and a `Failed` saga whose compensation has
    /// already run out of steps.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() || self.current_step.is_none()
    }

    /// Returns true if the saga is waiting on a reply for `step`.
    pub fn awaits(&self, step: SagaStep) -> bool {
        !self.is_finished() && self.current_step == Some(step)
    }

    /// Returns a copy moved to `status`/`current_step`, stamped now.
    pub fn transition(&self, status: SagaStatus, current_step: Option<SagaStep>) -> Self {
        Self {
            status,
            current_step,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Replaces the accumulated payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Overrides the `updated_at` stamp.
    pub fn touched_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_saga_is_started_on_initial_step() {
        let state = SagaState::new(
            SagaId::new(),
            OrderId::new(),
            SagaStep::ReserveInventory,
            serde_json::json!({"customer_id": "c-1"}),
        );

        assert_eq!(state.status, SagaStatus::Started);
        assert_eq!(state.current_step, Some(SagaStep::ReserveInventory));
        assert_eq!(state.started_at, state.updated_at);
        assert!(state.awaits(SagaStep::ReserveInventory));
        assert!(!state.awaits(SagaStep::ProcessPayment));
        assert!(!state.is_finished());
    }

    #[test]
    fn transition_keeps_identity_and_payload() {
        let state = SagaState::new(
            SagaId::new(),
            OrderId::new(),
            SagaStep::ReserveInventory,
            serde_json::json!({"k": 1}),
        );

        let next = state.transition(SagaStatus::InProgress, Some(SagaStep::ProcessPayment));
        assert_eq!(next.saga_id, state.saga_id);
        assert_eq!(next.order_id, state.order_id);
        assert_eq!(next.started_at, state.started_at);
        assert_eq!(next.payload, state.payload);
        assert!(next.updated_at >= state.updated_at);
    }

    #[test]
    fn failed_without_step_is_finished() {
        let state = SagaState::new(
            SagaId::new(),
            OrderId::new(),
            SagaStep::ReserveInventory,
            serde_json::Value::Null,
        );

        let compensating = state.transition(SagaStatus::Failed, Some(SagaStep::CompensatePayment));
        assert!(!compensating.is_finished());

        let gave_up = state.transition(SagaStatus::Failed, None);
        assert!(gave_up.is_finished());
    }

    #[test]
    fn step_string_forms() {
        for step in SagaStep::ALL {
            assert_eq!(step.as_str().parse::<SagaStep>().unwrap(), step);
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
        }

        let err = "CONFIRM_ORDER".parse::<SagaStep>().unwrap_err();
        assert_eq!(err.to_string(), "unknown saga step: CONFIRM_ORDER");
    }
}
