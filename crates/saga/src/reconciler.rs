//! Periodic recovery of stalled sagas.
//!
//! A saga stalls when its command was never published or its reply was
//! lost. The sweep finds sagas that have not moved within the stall timeout
//! and re-issues whatever command they are waiting on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use messaging::Broker;
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::orchestrator::{Orchestrator, ReissueOutcome};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long a saga may sit on one step before it is re-driven.
    pub stall_timeout: Duration,
    /// Maximum sagas examined per sweep.
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub reissued: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Reconciler<S, B> {
    orchestrator: Arc<Orchestrator<S, B>>,
    config: ReconcilerConfig,
}

impl<S: SagaStore, B: Broker> Reconciler<S, B> {
    pub fn new(orchestrator: Arc<Orchestrator<S, B>>, config: ReconcilerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Runs one sweep as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = chrono::Duration::from_std(self.config.stall_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stalled = self
            .orchestrator
            .store()
            .find_stalled(cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: stalled.len(),
            ..SweepReport::default()
        };

        for state in &stalled {
            match self.orchestrator.reissue(state, now).await {
                Ok(ReissueOutcome::Reissued(_)) => report.reissued += 1,
                Ok(ReissueOutcome::Skipped) => report.skipped += 1,
                Ok(ReissueOutcome::PublishFailed) => report.failed += 1,
                Err(e) => {
                    tracing::warn!(saga_id = %state.saga_id, error = %e, "Could not reconcile saga");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sweeps on every interval until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            stall_timeout_ms = self.config.stall_timeout.as_millis() as u64,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.examined > 0 => {
                    tracing::info!(
                        examined = report.examined,
                        reissued = report.reissued,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Reconciliation sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Reconciliation sweep failed"),
            }
        }

        tracing::info!("Reconciler stopped");
    }
}
