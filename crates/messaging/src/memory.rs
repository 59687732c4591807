use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::broker::{Acks, Broker, OutboundRecord, Record, RecordPosition};
use crate::error::BrokerError;

type PartitionKey = (String, String, u32);

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    /// Next offset to deliver after a restart, per (group, topic, partition).
    committed: HashMap<PartitionKey, u64>,
    /// Next offset to deliver in the current session.
    fetched: HashMap<PartitionKey, u64>,
    history: Vec<Record>,
    fail_produces: usize,
    produce_attempts: usize,
    fail_commits: usize,
    closed: bool,
}

/// In-process partitioned log.
///
/// Behaves like a single-node Kafka cluster: topics are created on first
/// use, records are routed to a partition by key hash, and each consumer
/// group tracks its own fetch and commit positions. Tests can inject produce
/// failures and rewind a group to its last commit to simulate a crash.
#[derive(Clone)]
pub struct InMemoryBroker {
    partitions: u32,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl InMemoryBroker {
    /// Creates a broker whose topics have `partitions` partitions each.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Returns the partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions)) as u32
    }

    /// Makes the next `n` produce calls fail with a transient error.
    pub async fn fail_next_produces(&self, n: usize) {
        self.state.lock().await.fail_produces = n;
    }

    /// Makes the next `n` commit calls fail with a transient error.
    pub async fn fail_next_commits(&self, n: usize) {
        self.state.lock().await.fail_commits = n;
    }

    /// Number of produce calls seen, failed ones included.
    pub async fn produce_attempts(&self) -> usize {
        self.state.lock().await.produce_attempts
    }

    /// Every record produced so far, in produce order.
    pub async fn produced(&self) -> Vec<Record> {
        self.state.lock().await.history.clone()
    }

    /// Records produced to `topic`, in produce order.
    pub async fn published(&self, topic: &str) -> Vec<Record> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// The next offset `group` will resume from after a restart.
    pub async fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.state
            .lock()
            .await
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Resets every fetch position of `group` to its last commit.
    ///
    /// Records fetched but not committed are delivered again, as they would
    /// be after a consumer crash or partition rebalance.
    pub async fn rewind(&self, group: &str) {
        self.state
            .lock()
            .await
            .fetched
            .retain(|(g, _, _), _| g != group);
        self.notify.notify_waiters();
    }

    /// Closes the broker. Later calls fail with [`BrokerError::Closed`].
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    fn collect(
        state: &mut BrokerState,
        group: &str,
        topics: &[String],
        max_records: usize,
    ) -> Vec<Record> {
        let mut batch = Vec::new();

        for topic in topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };

            for (partition, log) in partitions.iter().enumerate() {
                if batch.len() >= max_records {
                    return batch;
                }

                let key = (group.to_string(), topic.clone(), partition as u32);
                let start = state
                    .fetched
                    .get(&key)
                    .or_else(|| state.committed.get(&key))
                    .copied()
                    .unwrap_or(0);

                let take = (max_records - batch.len()).min(log.len().saturating_sub(start as usize));
                if take == 0 {
                    continue;
                }

                batch.extend_from_slice(&log[start as usize..start as usize + take]);
                state.fetched.insert(key, start + take as u64);
            }
        }

        batch
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn produce(
        &self,
        record: OutboundRecord,
        _acks: Acks,
    ) -> Result<RecordPosition, BrokerError> {
        let position = {
            let mut state = self.state.lock().await;
            state.produce_attempts += 1;

            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.fail_produces > 0 {
                state.fail_produces -= 1;
                return Err(BrokerError::Transient("not enough in-sync replicas".into()));
            }

            let partition = self.partition_for(&record.key);
            let log = &mut state
                .topics
                .entry(record.topic.clone())
                .or_insert_with(|| vec![Vec::new(); self.partitions as usize])
                [partition as usize];

            let stored = Record {
                topic: record.topic,
                partition,
                offset: log.len() as u64,
                key: record.key,
                payload: record.payload,
                headers: record.headers,
                timestamp: Utc::now(),
            };
            log.push(stored.clone());

            let position = stored.position();
            state.history.push(stored);
            position
        };

        self.notify.notify_waiters();
        Ok(position)
    }

    async fn poll(
        &self,
        group: &str,
        topics: &[String],
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before looking so a produce in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(BrokerError::Closed);
                }
                let batch = Self::collect(&mut state, group, topics, max_records);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, group: &str, positions: &[RecordPosition]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(BrokerError::Transient("coordinator not available".into()));
        }

        for position in positions {
            let key = (group.to_string(), position.topic.clone(), position.partition);
            let next = position.offset + 1;
            let entry = state.committed.entry(key).or_insert(0);
            *entry = (*entry).max(next);
        }
        Ok(())
    }
}
