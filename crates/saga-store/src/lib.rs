//! Durable saga state storage.
//!
//! A saga record is created once and then mutated only through an optimistic
//! compare-and-update on its `(status, current_step)` pair. That single rule
//! makes duplicate and out-of-order reply delivery safe: a second writer
//! expecting the old position gets a [`SagaStoreError::Conflict`] instead of
//! overwriting newer state.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod status;
pub mod store;

pub use common::{OrderId, SagaId};
pub use error::{Result, SagaStoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use record::{ParseError, SagaState, SagaStep};
pub use status::SagaStatus;
pub use store::{SagaStore, validate_claim, validate_update};
