//! The saga state machine.
//!
//! Every transition is a compare-and-update on the saga's `(status,
//! current_step)`. A reply is applied only if the saga is still waiting on
//! that step; duplicates and stale replies find it elsewhere and are
//! discarded. The next command is published after the transition commits,
//! so a failed publish leaves a recoverable gap that the reconciler closes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{OrderId, SagaId};
use messaging::{Broker, CommandPublisher, EventEnvelope, EventType};
use saga_store::{SagaState, SagaStatus, SagaStep, SagaStore, SagaStoreError};

use crate::context::{CompensationFailure, SagaContext};
use crate::error::{Result, SagaError};
use crate::messages::{OrderCancelled, OrderPlaced, StepReply};
use crate::topics::Topics;
use crate::workflow::{ORDER_FULFILLMENT, ReplyOutcome, StepDefinition, WorkflowTable};

/// Re-reads allowed when a compare-and-update keeps conflicting.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

/// Why a message did not change any saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    UnknownSaga,
    AlreadyStarted,
    Finished(SagaStatus),
    StaleStep {
        awaiting: Option<SagaStep>,
        received: SagaStep,
    },
    NotCancellable(SagaStatus),
}

impl DiscardReason {
    fn label(&self) -> &'static str {
        match self {
            DiscardReason::UnknownSaga => "unknown_saga",
            DiscardReason::AlreadyStarted => "already_started",
            DiscardReason::Finished(_) => "finished",
            DiscardReason::StaleStep { .. } => "stale_step",
            DiscardReason::NotCancellable(_) => "not_cancellable",
        }
    }
}

/// What handling a message did to its saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Started,
    /// Moved to the next forward step.
    Advanced(SagaStep),
    Completed,
    /// Waiting on this compensation step.
    Compensating(SagaStep),
    Compensated,
    /// Compensation ran out of steps with at least one failure.
    CompensationIncomplete,
    Cancelled,
    Discarded(DiscardReason),
}

/// Result of re-issuing a stalled saga's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReissueOutcome {
    Reissued(SagaStep),
    /// The saga moved on or finished since it was read.
    Skipped,
    PublishFailed,
}

struct Decision {
    next: SagaState,
    command: Option<&'static StepDefinition>,
    disposition: Disposition,
}

/// Drives sagas through the workflow table.
pub struct Orchestrator<S, B> {
    store: Arc<S>,
    publisher: CommandPublisher<B>,
    workflow: &'static WorkflowTable,
    topics: Topics,
    max_conflict_retries: u32,
}

impl<S: SagaStore, B: Broker> Orchestrator<S, B> {
    /// Creates an orchestrator for the order fulfillment workflow.
    pub fn new(store: Arc<S>, publisher: CommandPublisher<B>, topics: Topics) -> Self {
        Self {
            store,
            publisher,
            workflow: &ORDER_FULFILLMENT,
            topics,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_workflow(mut self, workflow: &'static WorkflowTable) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn workflow(&self) -> &'static WorkflowTable {
        self.workflow
    }

    /// Creates a saga and issues its first command.
    ///
    /// Fails with `AlreadyExists` if the saga id is taken. A failed publish
    /// does not fail the call; the saga is stored and will be reconciled.
    #[tracing::instrument(skip(self, context), fields(saga_id = %saga_id, order_id = %order_id))]
    pub async fn start_saga(
        &self,
        saga_id: SagaId,
        order_id: OrderId,
        context: SagaContext,
    ) -> Result<SagaState> {
        let first = self.workflow.first().ok_or(SagaError::EmptyWorkflow)?;

        let state = self
            .store
            .create(saga_id, order_id, first.step, context.to_value()?)
            .await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(workflow = self.workflow.name, step = %first.step, "Saga started");

        self.issue(&state, first).await;
        Ok(state)
    }

    /// Loads a saga.
    pub async fn saga(&self, saga_id: SagaId) -> Result<SagaState> {
        Ok(self.store.load(saga_id).await?)
    }

    /// Handles any message the orchestrator subscribes to.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            saga_id = %envelope.saga_id,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type
        )
    )]
    pub async fn handle_envelope(&self, envelope: &EventEnvelope) -> Result<Disposition> {
        match envelope.event_type {
            EventType::OrderPlaced => {
                let order: OrderPlaced = envelope.payload_as()?;
                match self
                    .start_saga(envelope.saga_id, envelope.order_id, order.into())
                    .await
                {
                    Ok(_) => Ok(Disposition::Started),
                    Err(SagaError::Store(SagaStoreError::AlreadyExists(_))) => {
                        Ok(self.discard(DiscardReason::AlreadyStarted))
                    }
                    Err(e) => Err(e),
                }
            }
            EventType::OrderCancelled => {
                let cancelled: OrderCancelled = envelope.payload_as()?;
                self.cancel(envelope.saga_id, cancelled.reason).await
            }
            event_type => {
                let (step, outcome) = self
                    .workflow
                    .resolve_reply(event_type)
                    .ok_or(SagaError::UnexpectedEvent(event_type))?;
                let reply: StepReply = envelope.payload_as()?;
                self.handle_reply(envelope.saga_id, step, outcome, &reply)
                    .await
            }
        }
    }

    /// Applies a participant reply for `step`.
    pub async fn handle_reply(
        &self,
        saga_id: SagaId,
        step: SagaStep,
        outcome: ReplyOutcome,
        reply: &StepReply,
    ) -> Result<Disposition> {
        let confirmed = outcome.confirmed_by(reply.success);
        if confirmed != outcome {
            tracing::warn!(
                step = %step,
                reason = %reply.message,
                "Reply event reports success but its body does not, treating it as failed"
            );
        }
        let outcome = confirmed;
        metrics::counter!("saga_replies_total", "step" => step.as_str(), "outcome" => outcome.as_str())
            .increment(1);

        let mut attempts = 0;
        loop {
            let state = match self.store.load(saga_id).await {
                Ok(state) => state,
                Err(SagaStoreError::NotFound(_)) => {
                    return Ok(self.discard(DiscardReason::UnknownSaga));
                }
                Err(e) => return Err(e.into()),
            };

            if state.is_finished() {
                return Ok(self.discard(DiscardReason::Finished(state.status)));
            }
            if !state.awaits(step) {
                return Ok(self.discard(DiscardReason::StaleStep {
                    awaiting: state.current_step,
                    received: step,
                }));
            }

            let decision = self.decide(&state, step, outcome, reply)?;
            match self
                .store
                .compare_and_update(saga_id, state.status, state.current_step, decision.next)
                .await
            {
                Ok(stored) => {
                    self.record(&stored, decision.disposition);
                    if let Some(definition) = decision.command {
                        self.issue(&stored, definition).await;
                    }
                    return Ok(decision.disposition);
                }
                Err(SagaStoreError::Conflict { .. }) => {
                    attempts += 1;
                    if attempts > self.max_conflict_retries {
                        return Err(SagaError::ConflictRetriesExhausted { saga_id, attempts });
                    }
                    tracing::debug!(attempts, "Saga moved concurrently, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cancels a saga that has not finished or started compensating.
    #[tracing::instrument(skip(self, reason), fields(saga_id = %saga_id))]
    pub async fn cancel(&self, saga_id: SagaId, reason: Option<String>) -> Result<Disposition> {
        let mut attempts = 0;
        loop {
            let state = match self.store.load(saga_id).await {
                Ok(state) => state,
                Err(SagaStoreError::NotFound(_)) => {
                    return Ok(self.discard(DiscardReason::UnknownSaga));
                }
                Err(e) => return Err(e.into()),
            };

            if !state.status.can_cancel() {
                return Ok(self.discard(DiscardReason::NotCancellable(state.status)));
            }

            let mut context = SagaContext::from_value(&state.payload)?;
            context.cancel_reason = Some(reason.clone().unwrap_or_else(|| "cancelled".to_string()));
            let next = state
                .transition(SagaStatus::Cancelled, None)
                .with_payload(context.to_value()?);

            match self
                .store
                .compare_and_update(saga_id, state.status, state.current_step, next)
                .await
            {
                Ok(stored) => {
                    self.record(&stored, Disposition::Cancelled);
                    return Ok(Disposition::Cancelled);
                }
                Err(SagaStoreError::Conflict { .. }) => {
                    attempts += 1;
                    if attempts > self.max_conflict_retries {
                        return Err(SagaError::ConflictRetriesExhausted { saga_id, attempts });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-publishes the command a stalled saga is waiting on.
    ///
    /// The saga is first claimed by moving its `updated_at` to `now`. The
    /// claim only succeeds while the record is exactly as `state` saw it, so
    /// of several sweepers holding the same snapshot one publishes and the
    /// rest skip.
    #[tracing::instrument(skip(self, state), fields(saga_id = %state.saga_id))]
    pub async fn reissue(&self, state: &SagaState, now: DateTime<Utc>) -> Result<ReissueOutcome> {
        let Some(step) = state.current_step.filter(|_| !state.is_finished()) else {
            return Ok(ReissueOutcome::Skipped);
        };
        let definition = self
            .workflow
            .definition(step)
            .ok_or(SagaError::UnknownStep(step))?;

        let claimed = match self.store.claim(state, now).await {
            Ok(claimed) => claimed,
            Err(SagaStoreError::StaleClaim { .. }) => return Ok(ReissueOutcome::Skipped),
            Err(e) => return Err(e.into()),
        };

        if !self.issue(&claimed, definition).await {
            return Ok(ReissueOutcome::PublishFailed);
        }

        metrics::counter!("saga_reconciled_total", "step" => step.as_str()).increment(1);
        tracing::info!(step = %step, status = %claimed.status, "Re-issued stalled command");
        Ok(ReissueOutcome::Reissued(step))
    }

    fn decide(
        &self,
        state: &SagaState,
        step: SagaStep,
        outcome: ReplyOutcome,
        reply: &StepReply,
    ) -> Result<Decision> {
        let mut context = SagaContext::from_value(&state.payload)?;

        let (status, command, disposition) = if self.workflow.is_compensation(step) {
            if outcome == ReplyOutcome::Failure {
                tracing::warn!(step = %step, reason = %reply.message, "Compensation step failed");
                context.compensation_failures.push(CompensationFailure {
                    step,
                    reason: reply.message.clone(),
                });
            }

            match self.workflow.compensation_after(step) {
                Some(next) => (
                    SagaStatus::Failed,
                    Some(next),
                    Disposition::Compensating(next.step),
                ),
                None if context.compensation_failures.is_empty() => {
                    (SagaStatus::Compensated, None, Disposition::Compensated)
                }
                None => (SagaStatus::Failed, None, Disposition::CompensationIncomplete),
            }
        } else {
            if self.workflow.position(step).is_none() {
                return Err(SagaError::UnknownStep(step));
            }

            match outcome {
                ReplyOutcome::Success if self.workflow.is_last(step) => {
                    context.absorb(step, reply);
                    (SagaStatus::Completed, None, Disposition::Completed)
                }
                ReplyOutcome::Success => {
                    context.absorb(step, reply);
                    let next = self
                        .workflow
                        .next(step)
                        .ok_or(SagaError::UnknownStep(step))?;
                    (
                        SagaStatus::InProgress,
                        Some(next),
                        Disposition::Advanced(next.step),
                    )
                }
                ReplyOutcome::Failure => {
                    context.failed_step = Some(step);
                    context.failure_reason = Some(reply.message.clone());
                    for kept in self.workflow.irreversible_before(step) {
                        tracing::info!(step = %kept, "Irreversible step left in effect");
                    }
                    tracing::info!(
                        failed = %step,
                        plan = ?self.workflow.compensation_plan(step),
                        "Compensation planned"
                    );

                    match self.workflow.compensation_after_failure(step) {
                        Some(first) => (
                            SagaStatus::Failed,
                            Some(first),
                            Disposition::Compensating(first.step),
                        ),
                        None => (SagaStatus::Compensated, None, Disposition::Compensated),
                    }
                }
            }
        };

        let next = state
            .transition(status, command.map(|d| d.step))
            .with_payload(context.to_value()?);

        Ok(Decision {
            next,
            command,
            disposition,
        })
    }

    /// Publishes the command for `definition`. Returns false on a gap.
    async fn issue(&self, state: &SagaState, definition: &StepDefinition) -> bool {
        let published = async {
            let context = SagaContext::from_value(&state.payload)?;
            let payload = context.command_payload(definition, state.order_id)?;
            let envelope =
                EventEnvelope::new(definition.command, state.saga_id, state.order_id, payload);
            self.publisher
                .publish(
                    self.topics.command_topic(definition.service),
                    state.saga_id,
                    &envelope,
                )
                .await?;
            Ok::<_, SagaError>(())
        }
        .await;

        match published {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("saga_publish_gaps_total").increment(1);
                tracing::warn!(
                    saga_id = %state.saga_id,
                    step = %definition.step,
                    error = %e,
                    "Command not published, reconciliation will re-issue it"
                );
                false
            }
        }
    }

    fn discard(&self, reason: DiscardReason) -> Disposition {
        metrics::counter!("saga_replies_discarded_total", "reason" => reason.label()).increment(1);
        tracing::debug!(?reason, "Message discarded");
        Disposition::Discarded(reason)
    }

    fn record(&self, stored: &SagaState, disposition: Disposition) {
        let elapsed = (stored.updated_at - stored.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        match disposition {
            Disposition::Completed => {
                metrics::counter!("saga_completed_total").increment(1);
                metrics::histogram!("saga_duration_seconds", "outcome" => "completed")
                    .record(elapsed);
                tracing::info!(saga_id = %stored.saga_id, duration = elapsed, "Saga completed");
            }
            Disposition::Compensated => {
                metrics::counter!("saga_compensated_total").increment(1);
                metrics::histogram!("saga_duration_seconds", "outcome" => "compensated")
                    .record(elapsed);
                tracing::info!(saga_id = %stored.saga_id, duration = elapsed, "Saga compensated");
            }
            Disposition::CompensationIncomplete => {
                metrics::counter!("saga_failed_total").increment(1);
                metrics::histogram!("saga_duration_seconds", "outcome" => "failed")
                    .record(elapsed);
                tracing::error!(
                    saga_id = %stored.saga_id,
                    "Saga could not be fully compensated"
                );
            }
            Disposition::Cancelled => {
                metrics::counter!("saga_cancelled_total").increment(1);
                tracing::info!(saga_id = %stored.saga_id, "Saga cancelled");
            }
            Disposition::Compensating(step) => {
                tracing::info!(saga_id = %stored.saga_id, step = %step, "Compensating");
            }
            Disposition::Advanced(step) => {
                tracing::debug!(saga_id = %stored.saga_id, step = %step, "Saga advanced");
            }
            Disposition::Started | Disposition::Discarded(_) => {}
        }
    }
}
