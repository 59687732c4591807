//! The static workflow table.
//!
//! Step order defines the forward path. Walking the steps before a failed
//! one in reverse defines the compensation path. A step marked
//! [`Compensation::Irreversible`] is left as-is when a later step fails.

use messaging::EventType;
use saga_store::SagaStep;

/// A downstream service owning one command and one reply topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Inventory,
    Payment,
    Notification,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Inventory => "inventory",
            Service::Payment => "payment",
            Service::Notification => "notification",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a completed forward step is undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Run this compensation step.
    Compensate(SagaStep),
    /// The step cannot be undone.
    Irreversible,
}

/// One step of the workflow.
///
/// The command and reply topics are those of `service`, resolved through
/// [`Topics`](crate::Topics) at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefinition {
    pub step: SagaStep,
    pub service: Service,
    pub command: EventType,
    pub success_reply: EventType,
    pub failure_reply: EventType,
    pub compensation: Compensation,
}

/// What a reply says about its step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Success,
    Failure,
}

impl ReplyOutcome {
    /// Combines the outcome implied by a reply's event type with the
    /// `success` flag in its body. Either one reporting failure wins.
    pub fn confirmed_by(self, success: bool) -> Self {
        if success { self } else { ReplyOutcome::Failure }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyOutcome::Success => "success",
            ReplyOutcome::Failure => "failure",
        }
    }
}

/// An ordered, immutable saga definition.
#[derive(Debug)]
pub struct WorkflowTable {
    pub name: &'static str,
    /// Forward steps in execution order.
    pub steps: &'static [StepDefinition],
    /// Compensation steps referenced by forward steps.
    pub compensations: &'static [StepDefinition],
}

/// Reserve inventory, take payment, notify the customer.
///
/// Payment is refunded and inventory released on a later failure. The
/// notification cannot be taken back.
pub static ORDER_FULFILLMENT: WorkflowTable = WorkflowTable {
    name: "OrderFulfillment",
    steps: &[
        StepDefinition {
            step: SagaStep::ReserveInventory,
            service: Service::Inventory,
            command: EventType::ReserveInventory,
            success_reply: EventType::InventoryReserved,
            failure_reply: EventType::InventoryFailed,
            compensation: Compensation::Compensate(SagaStep::CompensateInventory),
        },
        StepDefinition {
            step: SagaStep::ProcessPayment,
            service: Service::Payment,
            command: EventType::ProcessPayment,
            success_reply: EventType::PaymentProcessed,
            failure_reply: EventType::PaymentFailed,
            compensation: Compensation::Compensate(SagaStep::CompensatePayment),
        },
        StepDefinition {
            step: SagaStep::SendNotification,
            service: Service::Notification,
            command: EventType::SendNotification,
            success_reply: EventType::NotificationSent,
            failure_reply: EventType::NotificationFailed,
            compensation: Compensation::Irreversible,
        },
    ],
    compensations: &[
        StepDefinition {
            step: SagaStep::CompensatePayment,
            service: Service::Payment,
            command: EventType::RefundPayment,
            success_reply: EventType::PaymentRefunded,
            failure_reply: EventType::PaymentRefundFailed,
            compensation: Compensation::Irreversible,
        },
        StepDefinition {
            step: SagaStep::CompensateInventory,
            service: Service::Inventory,
            command: EventType::ReleaseInventory,
            success_reply: EventType::InventoryReleased,
            failure_reply: EventType::InventoryReleaseFailed,
            compensation: Compensation::Irreversible,
        },
    ],
};

impl WorkflowTable {
    /// The step a new saga starts on.
    pub fn first(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    /// Looks up a forward or compensation step.
    pub fn definition(&self, step: SagaStep) -> Option<&StepDefinition> {
        self.steps
            .iter()
            .chain(self.compensations)
            .find(|d| d.step == step)
    }

    /// Position of a forward step.
    pub fn position(&self, step: SagaStep) -> Option<usize> {
        self.steps.iter().position(|d| d.step == step)
    }

    /// The forward step after `step`, if any.
    pub fn next(&self, step: SagaStep) -> Option<&StepDefinition> {
        self.position(step).and_then(|i| self.steps.get(i + 1))
    }

    /// True for the final forward step.
    pub fn is_last(&self, step: SagaStep) -> bool {
        self.position(step) == Some(self.steps.len().saturating_sub(1)) && !self.steps.is_empty()
    }

    pub fn is_compensation(&self, step: SagaStep) -> bool {
        self.compensations.iter().any(|d| d.step == step)
    }

    /// First compensation to run after forward step `failed` fails.
    pub fn compensation_after_failure(&self, failed: SagaStep) -> Option<&StepDefinition> {
        let position = self.position(failed)?;
        self.compensation_before(position)
    }

    /// Compensation to run after compensation step `done` replied.
    pub fn compensation_after(&self, done: SagaStep) -> Option<&StepDefinition> {
        let position = self
            .steps
            .iter()
            .position(|d| d.compensation == Compensation::Compensate(done))?;
        self.compensation_before(position)
    }

    fn compensation_before(&self, position: usize) -> Option<&StepDefinition> {
        self.steps[..position]
            .iter()
            .rev()
            .find_map(|d| match d.compensation {
                Compensation::Compensate(step) => self.definition(step),
                Compensation::Irreversible => None,
            })
    }

    /// All compensation steps for a failure at `failed`, in execution order.
    pub fn compensation_plan(&self, failed: SagaStep) -> Vec<SagaStep> {
        let mut plan = Vec::new();
        let mut next = self.compensation_after_failure(failed);
        while let Some(definition) = next {
            plan.push(definition.step);
            next = self.compensation_after(definition.step);
        }
        plan
    }

    /// Completed steps that stay in effect when `failed` fails.
    pub fn irreversible_before(&self, failed: SagaStep) -> Vec<SagaStep> {
        let end = self.position(failed).unwrap_or(0);
        self.steps[..end]
            .iter()
            .filter(|d| d.compensation == Compensation::Irreversible)
            .map(|d| d.step)
            .collect()
    }

    /// Maps a reply event to the step it answers and whether it succeeded.
    pub fn resolve_reply(&self, event_type: EventType) -> Option<(SagaStep, ReplyOutcome)> {
        self.steps
            .iter()
            .chain(self.compensations)
            .find_map(|d| {
                if d.success_reply == event_type {
                    Some((d.step, ReplyOutcome::Success))
                } else if d.failure_reply == event_type {
                    Some((d.step, ReplyOutcome::Failure))
                } else {
                    None
                }
            })
    }

    /// Checks the table is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err(format!("workflow {} has no steps", self.name));
        }

        for definition in self.steps {
            if self.is_compensation(definition.step) {
                return Err(format!("{} is both forward and compensation", definition.step));
            }
            if let Compensation::Compensate(step) = definition.compensation
                && !self.is_compensation(step)
            {
                return Err(format!(
                    "{} compensates with undefined step {step}",
                    definition.step
                ));
            }
        }

        let mut replies = Vec::new();
        for definition in self.steps.iter().chain(self.compensations) {
            for reply in [definition.success_reply, definition.failure_reply] {
                if !reply.is_reply() || replies.contains(&reply) {
                    return Err(format!("reply {reply} is invalid or reused"));
                }
                replies.push(reply);
            }
            if !definition.command.is_command() {
                return Err(format!("{} is not a command", definition.command));
            }
        }
        Ok(())
    }
}
