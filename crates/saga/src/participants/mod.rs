//! Downstream services that execute saga commands.
//!
//! Each participant consumes its command topic and answers on its reply
//! topic. The in-memory implementations stand in for the real services in
//! tests and in the single-process server.

pub mod inventory;
pub mod notification;
pub mod payment;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use common::SagaId;
use messaging::{
    Broker, CommandPublisher, ConsumerConfig, EventEnvelope, EventType, HandlerError, Record,
    RecordHandler,
};
use tokio::sync::Mutex;

use crate::messages::StepReply;
use crate::topics::Topics;
use crate::workflow::Service;

pub use inventory::InMemoryInventoryService;
pub use notification::InMemoryNotificationService;
pub use payment::InMemoryPaymentService;

/// A participant's answer to one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub event_type: EventType,
    pub body: StepReply,
}

impl Reply {
    pub fn new(event_type: EventType, body: StepReply) -> Self {
        Self { event_type, body }
    }
}

/// Replies kept per participant before the oldest are forgotten.
pub const DEFAULT_REPLY_MEMORY: usize = 10_000;

/// Replies already sent, oldest first out once `capacity` is reached.
#[derive(Debug)]
struct AnsweredCommands {
    replies: HashMap<(SagaId, EventType), Reply>,
    order: VecDeque<(SagaId, EventType)>,
    capacity: usize,
}

impl AnsweredCommands {
    fn new(capacity: usize) -> Self {
        Self {
            replies: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &(SagaId, EventType)) -> Option<Reply> {
        self.replies.get(key).cloned()
    }

    fn remember(&mut self, key: (SagaId, EventType), reply: Reply) {
        if self.replies.insert(key, reply).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.replies.len()
    }
}

/// Executes the commands of one service.
#[async_trait]
pub trait Participant: Send + Sync {
    fn service(&self) -> Service;

    /// Performs the command and describes the outcome.
    ///
    /// A business failure is an `Ok` reply with a failure event type. An
    /// `Err` means the command could not be processed at all.
    async fn execute(&self, command: &EventEnvelope) -> Result<Reply, HandlerError>;
}

/// Consumer-side adapter for a participant.
///
/// Replies are remembered per saga and command type, so a redelivered
/// command is answered with the original reply instead of running twice.
/// Only the most recent [`DEFAULT_REPLY_MEMORY`] replies are kept; a
/// command redelivered after its reply was forgotten runs again.
pub struct ParticipantHandler<P, B> {
    participant: P,
    publisher: CommandPublisher<B>,
    reply_topic: String,
    answered: Mutex<AnsweredCommands>,
}

impl<P: Participant, B: Broker> ParticipantHandler<P, B> {
    pub fn new(participant: P, publisher: CommandPublisher<B>, topics: &Topics) -> Self {
        let reply_topic = topics.reply_topic(participant.service()).to_string();
        Self {
            participant,
            publisher,
            reply_topic,
            answered: Mutex::new(AnsweredCommands::new(DEFAULT_REPLY_MEMORY)),
        }
    }

    /// Caps how many replies are remembered for redeliveries.
    pub fn with_reply_memory(self, capacity: usize) -> Self {
        Self {
            answered: Mutex::new(AnsweredCommands::new(capacity)),
            ..self
        }
    }

    /// Number of replies currently remembered.
    pub async fn remembered_replies(&self) -> usize {
        self.answered.lock().await.len()
    }

    pub fn participant(&self) -> &P {
        &self.participant
    }

    /// Consumer settings for this participant's command topic.
    pub fn consumer_config(&self, group_id: impl Into<String>, topics: &Topics) -> ConsumerConfig {
        let service = self.participant.service();
        ConsumerConfig::new(group_id, vec![topics.command_topic(service).to_string()])
        .with_dead_letter_topic(topics.dead_letter.clone())
    }
}

#[async_trait]
impl<P: Participant, B: Broker> RecordHandler for ParticipantHandler<P, B> {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        let command = EventEnvelope::decode(&record.payload, &record.headers)
            .map_err(HandlerError::unrecoverable)?;
        if !command.event_type.is_command() {
            return Err(HandlerError::unrecoverable(format!(
                "{} is not a command",
                command.event_type
            )));
        }

        let key = (command.saga_id, command.event_type);
        let cached = self.answered.lock().await.get(&key);
        let reply = match cached {
            Some(reply) => {
                tracing::debug!(
                    saga_id = %command.saga_id,
                    command = %command.event_type,
                    "Command already answered, replaying reply"
                );
                reply
            }
            None => {
                let reply = self.participant.execute(&command).await?;
                self.answered.lock().await.remember(key, reply.clone());
                reply
            }
        };

        let envelope = EventEnvelope::with_payload(
            reply.event_type,
            command.saga_id,
            command.order_id,
            &reply.body,
        )
        .map_err(HandlerError::unrecoverable)?;

        self.publisher
            .publish(&self.reply_topic, command.saga_id, &envelope)
            .await
            .map_err(HandlerError::retryable)?;

        tracing::debug!(
            saga_id = %command.saga_id,
            command = %command.event_type,
            reply = %reply.event_type,
            "Command answered"
        );
        Ok(())
    }
}
