//! The port the saga engine uses to reach a partitioned, at-least-once log.
//!
//! Anything with per-partition ordering and consumer-group offsets fits
//! behind [`Broker`]: the in-process [`InMemoryBroker`](crate::InMemoryBroker)
//! or an adapter over a Kafka-protocol client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BrokerError;

/// A record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// How many replicas must acknowledge a write before `produce` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acks {
    /// Fire and forget.
    None,
    /// The partition leader only.
    Leader,
    /// Every in-sync replica.
    #[default]
    All,
}

/// A record about to be produced.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    /// Partitioning key. Records with equal keys keep their relative order.
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
}

/// Where a record lives in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// A record fetched from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<Header>,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// Returns the first header value with this key.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_slice())
    }
}

/// A partitioned log with consumer-group offset tracking.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a record and waits for the requested acknowledgement.
    async fn produce(&self, record: OutboundRecord, acks: Acks)
    -> Result<RecordPosition, BrokerError>;

    /// Fetches up to `max_records` records for `group` from `topics`.
    ///
    /// Waits up to `timeout` when nothing is available and returns an empty
    /// batch if the wait expires. Records of one partition come back in
    /// offset order, and a fetched record is not returned again to the same
    /// group unless its position is rewound.
    async fn poll(
        &self,
        group: &str,
        topics: &[String],
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError>;

    /// Commits consumption for `group` past each given position.
    async fn commit(&self, group: &str, positions: &[RecordPosition]) -> Result<(), BrokerError>;
}
