//! In-memory payment service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use messaging::{EventEnvelope, EventType, HandlerError};
use tokio::sync::RwLock;

use super::{Participant, Reply};
use crate::messages::{ProcessPayment, RefundPayment, StepReply};
use crate::workflow::Service;

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    /// Captured payments: saga id to (payment id, amount in cents).
    payments: HashMap<SagaId, (String, u64)>,
    next_id: u32,
    refunded: usize,
    fail_on_charge: bool,
    fail_on_refund: bool,
}

/// Payment service that records charges in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes charge commands answer with a decline.
    pub async fn set_fail_on_charge(&self, fail: bool) {
        self.state.write().await.fail_on_charge = fail;
    }

    pub async fn set_fail_on_refund(&self, fail: bool) {
        self.state.write().await.fail_on_refund = fail;
    }

    /// Number of payments captured and not refunded.
    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// The payment id captured for a saga.
    pub async fn payment_for(&self, saga_id: SagaId) -> Option<String> {
        self.state
            .read()
            .await
            .payments
            .get(&saga_id)
            .map(|(id, _)| id.clone())
    }

    pub async fn refunded_count(&self) -> usize {
        self.state.read().await.refunded
    }
}

#[async_trait]
impl Participant for InMemoryPaymentService {
    fn service(&self) -> Service {
        Service::Payment
    }

    async fn execute(&self, command: &EventEnvelope) -> Result<Reply, HandlerError> {
        match command.event_type {
            EventType::ProcessPayment => {
                let body: ProcessPayment =
                    command.payload_as().map_err(HandlerError::unrecoverable)?;
                let mut state = self.state.write().await;

                if state.fail_on_charge {
                    return Ok(Reply::new(
                        EventType::PaymentFailed,
                        StepReply::failed("Payment declined"),
                    ));
                }
                if body.amount_cents == 0 {
                    return Ok(Reply::new(
                        EventType::PaymentFailed,
                        StepReply::failed("Amount must be positive"),
                    ));
                }

                state.next_id += 1;
                let payment_id = format!("PAY-{:04}", state.next_id);
                state
                    .payments
                    .insert(command.saga_id, (payment_id.clone(), body.amount_cents));

                Ok(Reply::new(
                    EventType::PaymentProcessed,
                    StepReply {
                        payment_id: Some(payment_id),
                        ..StepReply::ok("Payment processed")
                    },
                ))
            }
            EventType::RefundPayment => {
                let body: RefundPayment =
                    command.payload_as().map_err(HandlerError::unrecoverable)?;
                let mut state = self.state.write().await;

                if state.fail_on_refund {
                    return Ok(Reply::new(
                        EventType::PaymentRefundFailed,
                        StepReply::failed("Refund rejected by gateway"),
                    ));
                }

                let matches = match (&body.payment_id, state.payments.get(&command.saga_id)) {
                    (Some(requested), Some((captured, _))) => requested == captured,
                    (None, Some(_)) => true,
                    (_, None) => false,
                };
                if matches {
                    state.payments.remove(&command.saga_id);
                    state.refunded += 1;
                }

                Ok(Reply::new(
                    EventType::PaymentRefunded,
                    StepReply::ok("Payment refunded"),
                ))
            }
            other => Err(HandlerError::unrecoverable(format!(
                "payment service cannot handle {other}"
            ))),
        }
    }
}
