use thiserror::Error;

/// Errors from encoding or decoding an [`EventEnvelope`](crate::EventEnvelope).
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// The record is malformed. Never retried.
    #[error("Decode error: {reason}")]
    Decode { reason: String },

    /// The payload does not have the shape the caller asked for.
    #[error("Payload error: {0}")]
    Payload(#[source] serde_json::Error),
}

impl EnvelopeError {
    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }
}

/// Errors reported by a [`Broker`](crate::Broker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// A temporary condition such as a leader election or a full buffer.
    #[error("Transient broker error: {0}")]
    Transient(String),

    /// The broker refused the request and will keep refusing it.
    #[error("Broker rejected request: {0}")]
    Rejected(String),

    /// The broker has been shut down.
    #[error("Broker closed")]
    Closed,
}

impl BrokerError {
    /// Returns true if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Errors from the [`CommandPublisher`](crate::CommandPublisher).
#[derive(Debug, Error)]
pub enum PublishError {
    /// Every attempt failed, or a non-retryable error was hit.
    #[error("Publish to {topic} failed after {attempts} attempt(s): {source}")]
    Failed {
        topic: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Outcome of a record handler that did not succeed.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing may succeed if the record is delivered again.
    #[error("Retryable: {0}")]
    Retryable(String),

    /// The record can never be processed and must be dead-lettered.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),
}

impl HandlerError {
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }

    pub fn unrecoverable(err: impl std::fmt::Display) -> Self {
        Self::Unrecoverable(err.to_string())
    }
}

/// Errors that stop a consumer loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Consumer has no topics to subscribe to")]
    NoTopics,
}
