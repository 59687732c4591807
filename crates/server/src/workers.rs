//! Background tasks: the orchestrator's consumer, the participants and the
//! reconciler, all stopped by one shutdown flag.

use std::sync::Arc;

use futures_util::future::join_all;
use messaging::{Broker, CommandPublisher, ConsumerConfig, RecordHandler, ReplyConsumer};
use saga::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService, Orchestrator,
    Participant, ParticipantHandler, Reconciler, SagaRecordHandler,
};
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;

/// The participant services run in this process.
#[derive(Debug, Clone, Default)]
pub struct Participants {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub notification: InMemoryNotificationService,
}

/// Handles to the running background tasks.
pub struct Workers {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Spawns every background task.
    pub fn spawn<S, B>(
        orchestrator: Arc<Orchestrator<S, B>>,
        publisher: CommandPublisher<B>,
        participants: Participants,
        config: &Config,
    ) -> Self
    where
        S: SagaStore + 'static,
        B: Broker + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        let mut workers = Self {
            shutdown,
            tasks: Vec::new(),
        };
        let topics = orchestrator.topics().clone();

        let orchestrator_config =
            ConsumerConfig::new(&config.orchestrator_group, topics.orchestrator_subscriptions())
                .with_dead_letter_topic(topics.dead_letter.clone())
                .with_shutdown_grace(config.shutdown_grace)
                .with_max_request_retries(config.max_request_retries);
        workers.consume(
            "orchestrator",
            ReplyConsumer::new(publisher.clone(), orchestrator_config),
            SagaRecordHandler::new(orchestrator.clone()),
        );

        workers.participant("inventory", participants.inventory, &publisher, config);
        workers.participant("payment", participants.payment, &publisher, config);
        workers.participant("notification", participants.notification, &publisher, config);

        let reconciler = Reconciler::new(orchestrator, config.reconciler_config());
        let shutdown = workers.shutdown.subscribe();
        workers.tasks.push((
            "reconciler",
            tokio::spawn(async move { reconciler.run(shutdown).await }),
        ));

        tracing::info!(tasks = workers.tasks.len(), "Background workers started");
        workers
    }

    fn participant<P, B>(
        &mut self,
        name: &'static str,
        participant: P,
        publisher: &CommandPublisher<B>,
        config: &Config,
    ) where
        P: Participant + 'static,
        B: Broker + 'static,
    {
        let group = config.service_groups.for_service(participant.service());
        let handler = ParticipantHandler::new(participant, publisher.clone(), &config.topics);
        let consumer_config = handler
            .consumer_config(group, &config.topics)
            .with_shutdown_grace(config.shutdown_grace)
            .with_max_request_retries(config.max_request_retries);
        self.consume(
            name,
            ReplyConsumer::new(publisher.clone(), consumer_config),
            handler,
        );
    }

    fn consume<B, H>(&mut self, name: &'static str, consumer: ReplyConsumer<B>, handler: H)
    where
        B: Broker + 'static,
        H: RecordHandler + 'static,
    {
        let shutdown = self.shutdown.subscribe();
        self.tasks.push((
            name,
            tokio::spawn(async move {
                match consumer.run(&handler, shutdown).await {
                    Ok(stats) => tracing::info!(
                        worker = name,
                        handled = stats.handled,
                        dead_lettered = stats.dead_lettered,
                        "Consumer finished"
                    ),
                    Err(e) => tracing::error!(worker = name, error = %e, "Consumer failed"),
                }
            }),
        ));
    }

    /// Flips the shutdown flag and waits for every task to finish.
    pub async fn shutdown(self) {
        // Receivers treat a dropped sender as shutdown too.
        let _ = self.shutdown.send(true);

        let (names, tasks): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        for (name, joined) in names.into_iter().zip(join_all(tasks).await) {
            if let Err(e) = joined {
                tracing::error!(worker = name, error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Background workers stopped");
    }
}
