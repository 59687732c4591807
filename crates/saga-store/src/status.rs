//! Saga status state machine.

use serde::{Deserialize, Serialize};

use crate::record::ParseError;

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Started ──► InProgress ──┬──► Completed
///    │            │        └──► Failed ──► Compensated
///    │            │
///    └────────────┴──► Cancelled
/// ```
///
/// `Failed` is held while compensation commands are outstanding. A saga whose
/// compensation could not fully succeed rests in `Failed` with no current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga created, first command issued.
    #[default]
    Started,

    /// At least one step succeeded, forward steps remain.
    InProgress,

    /// Every step succeeded (terminal).
    Completed,

    /// Cancelled by an explicit trigger (terminal).
    Cancelled,

    /// A step failed, compensation is running.
    Failed,

    /// Compensation finished after a failure (terminal).
    Compensated,
}

impl SagaStatus {
    /// All statuses, in state machine order.
    pub const ALL: [SagaStatus; 6] = [
        SagaStatus::Started,
        SagaStatus::InProgress,
        SagaStatus::Completed,
        SagaStatus::Cancelled,
        SagaStatus::Failed,
        SagaStatus::Compensated,
    ];

    /// Returns true if forward steps may still run.
    pub fn can_advance(&self) -> bool {
        matches!(self, SagaStatus::Started | SagaStatus::InProgress)
    }

    /// Returns true if the saga can be cancelled in this status.
    pub fn can_cancel(&self) -> bool {
        matches!(self, SagaStatus::Started | SagaStatus::InProgress)
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Cancelled | SagaStatus::Compensated
        )
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    ///
    /// Self-transitions of non-terminal statuses are allowed: they refresh a
    /// record without changing where it is in the machine.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;

        match self {
            Started => matches!(
                next,
                Started | InProgress | Completed | Cancelled | Failed | Compensated
            ),
            InProgress => matches!(
                next,
                InProgress | Completed | Cancelled | Failed | Compensated
            ),
            Failed => matches!(next, Failed | Compensated),
            Completed | Cancelled | Compensated => false,
        }
    }

    /// Returns the status name as stored and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::InProgress => "IN_PROGRESS",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Cancelled => "CANCELLED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseError::new("saga status", s))
    }
}
