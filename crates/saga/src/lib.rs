//! Saga orchestration for order fulfillment.
//!
//! An order moves through three forward steps, each a command to a
//! downstream service answered by a reply:
//!
//! 1. Reserve inventory
//! 2. Process payment
//! 3. Send notification
//!
//! If a step fails, completed compensable steps are undone in reverse
//! order, one command at a time. The notification is irreversible.
//!
//! - [`Orchestrator`] applies replies as compare-and-update transitions on
//!   the saga store and publishes the next command.
//! - [`Reconciler`] re-issues the pending command of sagas that stalled.
//! - [`participants`] holds the in-memory inventory, payment and
//!   notification services.

pub mod context;
pub mod error;
pub mod handler;
pub mod messages;
pub mod orchestrator;
pub mod participants;
pub mod reconciler;
pub mod topics;
pub mod workflow;

pub use context::{CompensationFailure, SagaContext};
pub use error::{Result, SagaError};
pub use handler::SagaRecordHandler;
pub use messages::{
    InventoryItem, OrderCancelled, OrderPlaced, ProcessPayment, RefundPayment, ReleaseInventory,
    ReserveInventory, SendNotification, StepReply,
};
pub use orchestrator::{
    DEFAULT_MAX_CONFLICT_RETRIES, DiscardReason, Disposition, Orchestrator, ReissueOutcome,
};
pub use participants::{
    DEFAULT_REPLY_MEMORY, InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService, Participant,
    ParticipantHandler, Reply,
};
pub use reconciler::{Reconciler, ReconcilerConfig, SweepReport};
pub use topics::Topics;
pub use workflow::{
    Compensation, ORDER_FULFILLMENT, ReplyOutcome, Service, StepDefinition, WorkflowTable,
};
