use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::broker::{Broker, Header, OutboundRecord, Record, RecordPosition};
use crate::error::{BrokerError, ConsumerError, HandlerError};
use crate::publisher::CommandPublisher;

pub const DLQ_REASON_HEADER: &str = "dlq-reason";
pub const DLQ_SOURCE_TOPIC_HEADER: &str = "dlq-source-topic";
pub const DLQ_SOURCE_PARTITION_HEADER: &str = "dlq-source-partition";
pub const DLQ_SOURCE_OFFSET_HEADER: &str = "dlq-source-offset";

/// Settings for one consumer-group subscription.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    /// Where unprocessable records go. Without one they are logged and skipped.
    pub dead_letter_topic: Option<String>,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    /// Wait between in-place retries of a failing record.
    pub retry_backoff: Duration,
    /// How long a shutting-down consumer may spend committing.
    pub shutdown_grace: Duration,
    /// Retries of a failed commit request before the batch is left uncommitted.
    pub max_request_retries: u32,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            dead_letter_topic: None,
            max_poll_records: 100,
            poll_timeout: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
            max_request_retries: 10,
        }
    }

    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_request_retries(mut self, retries: u32) -> Self {
        self.max_request_retries = retries;
        self
    }
}

/// Processes one record.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError>;
}

/// What happened to one polled batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub polled: usize,
    pub handled: usize,
    pub dead_lettered: usize,
    /// Shutdown arrived before the batch was fully processed.
    pub interrupted: bool,
    pub committed: bool,
}

/// Totals over the life of a consumer loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub batches: usize,
    pub handled: usize,
    pub dead_lettered: usize,
}

/// Durable, offset-committing subscription.
///
/// Records are handed to the handler one at a time in delivery order. A
/// position is committed only after its record was handled or
/// dead-lettered, so a crash in between leads to redelivery. A retryable
/// handler error blocks the batch and is retried in place until it succeeds
/// or shutdown is signalled.
pub struct ReplyConsumer<B> {
    publisher: CommandPublisher<B>,
    config: ConsumerConfig,
}

impl<B: Broker> ReplyConsumer<B> {
    /// Creates a consumer. Dead-lettering goes through `publisher`.
    pub fn new(publisher: CommandPublisher<B>, config: ConsumerConfig) -> Self {
        Self { publisher, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn broker(&self) -> &Arc<B> {
        self.publisher.broker()
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    #[tracing::instrument(skip_all, fields(group = %self.config.group_id))]
    pub async fn run<H: RecordHandler>(
        &self,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats, ConsumerError> {
        if self.config.topics.is_empty() {
            return Err(ConsumerError::NoTopics);
        }

        tracing::info!(topics = ?self.config.topics, "Consumer started");
        let mut stats = ConsumerStats::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                polled = self.poll() => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(BrokerError::Closed) => return Err(ConsumerError::Broker(BrokerError::Closed)),
                Err(e) => {
                    tracing::warn!(error = %e, "Poll failed, backing off");
                    if wait_or_shutdown(self.config.retry_backoff, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if records.is_empty() {
                continue;
            }

            let outcome = self.process(handler, records, &mut shutdown).await;
            stats.batches += 1;
            stats.handled += outcome.handled;
            stats.dead_lettered += outcome.dead_lettered;

            if outcome.interrupted {
                break;
            }
        }

        tracing::info!(
            handled = stats.handled,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// Polls once and processes whatever arrived.
    pub async fn poll_once<H: RecordHandler>(
        &self,
        handler: &H,
    ) -> Result<BatchOutcome, ConsumerError> {
        let (_keep_open, mut shutdown) = watch::channel(false);
        let records = self.poll().await?;
        Ok(self.process(handler, records, &mut shutdown).await)
    }

    async fn poll(&self) -> Result<Vec<Record>, BrokerError> {
        self.broker()
            .poll(
                &self.config.group_id,
                &self.config.topics,
                self.config.max_poll_records,
                self.config.poll_timeout,
            )
            .await
    }

    async fn process<H: RecordHandler>(
        &self,
        handler: &H,
        records: Vec<Record>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            polled: records.len(),
            ..BatchOutcome::default()
        };
        let mut done: Vec<RecordPosition> = Vec::with_capacity(records.len());

        'records: for record in &records {
            metrics::counter!("consumer_records_total", "topic" => record.topic.clone())
                .increment(1);

            loop {
                match handler.handle(record).await {
                    Ok(()) => {
                        outcome.handled += 1;
                        done.push(record.position());
                        break;
                    }
                    Err(HandlerError::Unrecoverable(reason)) => {
                        if self.dead_letter(record, &reason, shutdown).await {
                            outcome.dead_lettered += 1;
                            done.push(record.position());
                            break;
                        }
                        outcome.interrupted = true;
                        break 'records;
                    }
                    Err(HandlerError::Retryable(reason)) => {
                        metrics::counter!("consumer_handler_retries_total").increment(1);
                        tracing::warn!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            reason = %reason,
                            "Handler failed, retrying record"
                        );
                        if wait_or_shutdown(self.config.retry_backoff, shutdown).await {
                            outcome.interrupted = true;
                            break 'records;
                        }
                    }
                }
            }
        }

        if !done.is_empty() {
            outcome.committed = self.commit(&done, outcome.interrupted).await;
        }
        outcome
    }

    /// Commits processed positions; bounded by the grace period on shutdown.
    async fn commit(&self, positions: &[RecordPosition], shutting_down: bool) -> bool {
        let commit = self.commit_with_retries(positions);

        let result = if shutting_down {
            match tokio::time::timeout(self.config.shutdown_grace, commit).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        grace_ms = self.config.shutdown_grace.as_millis() as u64,
                        "Commit timed out during shutdown"
                    );
                    return false;
                }
            }
        } else {
            commit.await
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                // Uncommitted records are redelivered; handlers are idempotent.
                tracing::warn!(error = %e, count = positions.len(), "Commit failed");
                false
            }
        }
    }

    async fn commit_with_retries(&self, positions: &[RecordPosition]) -> Result<(), BrokerError> {
        let mut attempts = 0;
        loop {
            match self.broker().commit(&self.config.group_id, positions).await {
                Err(e) if e.is_retryable() && attempts < self.config.max_request_retries => {
                    attempts += 1;
                    tracing::debug!(attempts, error = %e, "Commit failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                result => return result,
            }
        }
    }

    /// Routes a record to the dead-letter topic.
    ///
    /// Returns false only if shutdown interrupted the attempt.
    async fn dead_letter(
        &self,
        record: &Record,
        reason: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let Some(topic) = &self.config.dead_letter_topic else {
            tracing::error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                reason,
                "Dropping unprocessable record, no dead-letter topic configured"
            );
            return true;
        };

        let mut headers = record.headers.clone();
        headers.extend([
            Header::new(DLQ_REASON_HEADER, reason),
            Header::new(DLQ_SOURCE_TOPIC_HEADER, record.topic.as_str()),
            Header::new(DLQ_SOURCE_PARTITION_HEADER, record.partition.to_string()),
            Header::new(DLQ_SOURCE_OFFSET_HEADER, record.offset.to_string()),
        ]);
        let dead = OutboundRecord {
            topic: topic.clone(),
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers,
        };

        loop {
            match self.publisher.publish_raw(dead.clone()).await {
                Ok(_) => {
                    metrics::counter!("consumer_dead_lettered_total", "topic" => record.topic.clone())
                        .increment(1);
                    tracing::warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        dead_letter_topic = %topic,
                        reason,
                        "Record dead-lettered"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Dead-letter publish failed, retrying");
                    if wait_or_shutdown(self.config.retry_backoff, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }
}

/// Sleeps for `delay`. Returns true if shutdown was signalled instead.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Acks;
    use crate::memory::InMemoryBroker;
    use crate::publisher::PublishPolicy;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Handler scripted per payload: "ok", "bad", or "flaky:N" (fails N times).
    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl RecordHandler for ScriptedHandler {
        async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
            let body = String::from_utf8_lossy(&record.payload).to_string();
            self.seen.lock().await.push(body.clone());

            if body == "bad" {
                return Err(HandlerError::unrecoverable("cannot decode"));
            }
            if let Some(n) = body.strip_prefix("flaky:") {
                let limit: u32 = n.parse().unwrap();
                let mut failures = self.failures.lock().await;
                let count = failures.entry(body.clone()).or_insert(0);
                if *count < limit {
                    *count += 1;
                    return Err(HandlerError::retryable("store unavailable"));
                }
            }
            Ok(())
        }
    }

    fn setup(partitions: u32) -> (Arc<InMemoryBroker>, ReplyConsumer<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new(partitions));
        let publisher = CommandPublisher::new(
            broker.clone(),
            PublishPolicy {
                max_retries: 0,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                acks: Acks::All,
            },
        );
        let config = ConsumerConfig::new("orchestrator", vec!["replies".to_string()])
            .with_dead_letter_topic("orders-dlq")
            .with_retry_backoff(Duration::from_millis(1))
            .with_poll_timeout(Duration::from_millis(20));
        (broker, ReplyConsumer::new(publisher, config))
    }

    async fn send(broker: &InMemoryBroker, body: &str) {
        broker
            .produce(
                OutboundRecord {
                    topic: "replies".into(),
                    key: "saga".into(),
                    payload: body.as_bytes().to_vec(),
                    headers: vec![Header::new("metadata", "{}")],
                },
                Acks::All,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commits_after_handling() {
        let (broker, consumer) = setup(1);
        send(&broker, "ok").await;
        send(&broker, "ok").await;

        let handler = ScriptedHandler::default();
        let outcome = consumer.poll_once(&handler).await.unwrap();

        assert_eq!(outcome.handled, 2);
        assert!(outcome.committed);
        assert_eq!(
            broker.committed_offset("orchestrator", "replies", 0).await,
            Some(2)
        );
    }

    #[tokio::test]
    async fn transient_commit_failures_are_retried() {
        let (broker, consumer) = setup(1);
        send(&broker, "ok").await;
        broker.fail_next_commits(2).await;

        let outcome = consumer.poll_once(&ScriptedHandler::default()).await.unwrap();

        assert!(outcome.committed);
        assert_eq!(
            broker.committed_offset("orchestrator", "replies", 0).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn commit_gives_up_after_request_retries() {
        let (broker, consumer) = setup(1);
        let consumer = ReplyConsumer::new(
            consumer.publisher.clone(),
            consumer.config().clone().with_max_request_retries(1),
        );
        send(&broker, "ok").await;
        broker.fail_next_commits(2).await;

        let handler = ScriptedHandler::default();
        let outcome = consumer.poll_once(&handler).await.unwrap();
        assert_eq!(outcome.handled, 1);
        assert!(!outcome.committed);
        assert_eq!(broker.committed_offset("orchestrator", "replies", 0).await, None);

        // The uncommitted record comes back after a restart.
        broker.rewind("orchestrator").await;
        let outcome = consumer.poll_once(&handler).await.unwrap();
        assert_eq!(outcome.handled, 1);
        assert!(outcome.committed);
        assert_eq!(handler.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn unrecoverable_record_is_dead_lettered_and_skipped() {
        let (broker, consumer) = setup(1);
        send(&broker, "bad").await;
        send(&broker, "ok").await;

        let handler = ScriptedHandler::default();
        let outcome = consumer.poll_once(&handler).await.unwrap();

        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(outcome.handled, 1);
        assert_eq!(
            broker.committed_offset("orchestrator", "replies", 0).await,
            Some(2)
        );

        let dead = broker.published("orders-dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"bad");
        assert_eq!(dead[0].key, "saga");
        assert_eq!(dead[0].header("metadata"), Some(b"{}".as_slice()));
        assert_eq!(dead[0].header(DLQ_REASON_HEADER), Some(b"cannot decode".as_slice()));
        assert_eq!(dead[0].header(DLQ_SOURCE_TOPIC_HEADER), Some(b"replies".as_slice()));
        assert_eq!(dead[0].header(DLQ_SOURCE_OFFSET_HEADER), Some(b"0".as_slice()));
    }

    #[tokio::test]
    async fn retryable_record_is_retried_in_place() {
        let (broker, consumer) = setup(1);
        send(&broker, "flaky:3").await;
        send(&broker, "ok").await;

        let handler = ScriptedHandler::default();
        let outcome = consumer.poll_once(&handler).await.unwrap();

        assert_eq!(outcome.handled, 2);
        let seen = handler.seen.lock().await.clone();
        assert_eq!(seen, vec!["flaky:3", "flaky:3", "flaky:3", "flaky:3", "ok"]);
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered_after_rewind() {
        let (broker, consumer) = setup(1);
        send(&broker, "ok").await;

        let handler = ScriptedHandler::default();
        consumer.poll_once(&handler).await.unwrap();

        // A record fetched but never handled.
        send(&broker, "ok").await;
        broker
            .poll(
                "orchestrator",
                &["replies".to_string()],
                10,
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        broker.rewind("orchestrator").await;
        let outcome = consumer.poll_once(&handler).await.unwrap();
        assert_eq!(outcome.polled, 1);
        assert_eq!(outcome.handled, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_commits() {
        let (broker, consumer) = setup(2);
        let consumer = Arc::new(consumer);
        let handler = Arc::new(ScriptedHandler::default());
        let (tx, rx) = watch::channel(false);

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.run(handler.as_ref(), rx).await })
        };

        for _ in 0..3 {
            send(&broker, "ok").await;
        }

        for _ in 0..100 {
            if handler.seen.lock().await.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.handled, 3);

        let partition = broker.partition_for("saga");
        assert_eq!(
            broker
                .committed_offset("orchestrator", "replies", partition)
                .await,
            Some(3)
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_retry_loop_without_committing_record() {
        let (broker, consumer) = setup(1);
        let consumer = Arc::new(consumer);
        let handler = Arc::new(ScriptedHandler::default());
        let (tx, rx) = watch::channel(false);

        send(&broker, "ok").await;
        send(&broker, "flaky:1000000").await;

        let task = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.run(handler.as_ref(), rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // The handled record is committed, the stuck one is left for redelivery.
        assert_eq!(
            broker.committed_offset("orchestrator", "replies", 0).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn run_without_topics_fails() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let consumer = ReplyConsumer::new(
            CommandPublisher::new(broker, PublishPolicy::default()),
            ConsumerConfig::new("g", Vec::new()),
        );
        let (_tx, rx) = watch::channel(false);
        let result = consumer.run(&ScriptedHandler::default(), rx).await;
        assert!(matches!(result, Err(ConsumerError::NoTopics)));
    }
}
