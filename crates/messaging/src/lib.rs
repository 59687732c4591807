//! Messaging for the saga engine.
//!
//! - [`EventEnvelope`]: the canonical message wrapper and its wire form.
//! - [`Broker`]: the port to a partitioned, at-least-once log, with
//!   [`InMemoryBroker`] as the in-process implementation.
//! - [`CommandPublisher`]: keyed publishing with bounded retry.
//! - [`ReplyConsumer`]: commit-after-handle consumption with dead-lettering.

pub mod broker;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod publisher;

pub use broker::{Acks, Broker, Header, OutboundRecord, Record, RecordPosition};
pub use consumer::{
    BatchOutcome, ConsumerConfig, ConsumerStats, DLQ_REASON_HEADER, DLQ_SOURCE_OFFSET_HEADER,
    DLQ_SOURCE_PARTITION_HEADER, DLQ_SOURCE_TOPIC_HEADER, RecordHandler, ReplyConsumer,
};
pub use envelope::{EncodedEnvelope, EventEnvelope, EventType, METADATA_HEADER, SCHEMA_VERSION};
pub use error::{BrokerError, ConsumerError, EnvelopeError, HandlerError, PublishError};
pub use memory::InMemoryBroker;
pub use publisher::{CommandPublisher, PublishPolicy};
