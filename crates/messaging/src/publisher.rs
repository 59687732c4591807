use std::sync::Arc;
use std::time::Duration;

use common::SagaId;

use crate::broker::{Acks, Broker, OutboundRecord, RecordPosition};
use crate::envelope::EventEnvelope;
use crate::error::PublishError;

/// Retry and durability settings for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub acks: Acks,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            acks: Acks::All,
        }
    }
}

impl PublishPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Publishes commands and replies keyed by saga id.
///
/// Transient broker errors are retried with exponential backoff up to the
/// policy bound. Anything else, or running out of retries, is reported as
/// [`PublishError::Failed`].
pub struct CommandPublisher<B> {
    broker: Arc<B>,
    policy: PublishPolicy,
}

impl<B> Clone for CommandPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            policy: self.policy.clone(),
        }
    }
}

impl<B: Broker> CommandPublisher<B> {
    pub fn new(broker: Arc<B>, policy: PublishPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn policy(&self) -> &PublishPolicy {
        &self.policy
    }

    /// Publishes an envelope to `topic`, partitioned by `key`.
    #[tracing::instrument(
        skip(self, envelope),
        fields(saga_id = %key, event_id = %envelope.event_id, event_type = %envelope.event_type)
    )]
    pub async fn publish(
        &self,
        topic: &str,
        key: SagaId,
        envelope: &EventEnvelope,
    ) -> Result<RecordPosition, PublishError> {
        let encoded = envelope.encode()?;
        self.publish_raw(OutboundRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: encoded.payload,
            headers: encoded.headers,
        })
        .await
    }

    /// Publishes a pre-built record.
    pub async fn publish_raw(&self, record: OutboundRecord) -> Result<RecordPosition, PublishError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            metrics::counter!("publisher_attempts_total", "topic" => record.topic.clone())
                .increment(1);

            match self.broker.produce(record.clone(), self.policy.acks).await {
                Ok(position) => {
                    tracing::debug!(
                        topic = %position.topic,
                        partition = position.partition,
                        offset = position.offset,
                        attempt,
                        "Record published"
                    );
                    return Ok(position);
                }
                Err(e) if e.is_retryable() && attempt <= self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        topic = %record.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::counter!("publisher_failures_total", "topic" => record.topic.clone())
                        .increment(1);
                    tracing::error!(topic = %record.topic, attempts = attempt, error = %e, "Publish failed");
                    return Err(PublishError::Failed {
                        topic: record.topic,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}
