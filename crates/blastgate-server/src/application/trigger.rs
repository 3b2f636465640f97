//! Scheduled blast trigger.
//!
//! Polls for pending blasts whose scheduled time has come and hands them to
//! the orchestrator.  A blast whose device is not connected stays pending
//! and is looked at again on the next tick.  The same gate decides whether
//! a blast created with "send now" starts at once.

use std::sync::Arc;
use std::time::Duration;

use blastgate_core::{Blast, BlastId};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::orchestrator::{BlastOrchestrator, BlastRun, DeliveryError, DeviceSessions};
use crate::infrastructure::storage::{Database, StoreError};

/// What one trigger tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub dispatched: Vec<BlastId>,
    pub skipped: Vec<BlastId>,
}

/// Result of [`BlastTrigger::start_if_ready`].
#[derive(Debug)]
pub enum StartOutcome {
    Started(BlastRun),
    /// Scheduled in the future; the trigger starts it later.
    NotDue,
    /// The device has no connected session; the blast stays pending.
    DeviceNotConnected,
}

pub struct BlastTrigger {
    db: Database,
    sessions: Arc<dyn DeviceSessions>,
    orchestrator: Arc<BlastOrchestrator>,
}

impl BlastTrigger {
    pub fn new(
        db: Database,
        sessions: Arc<dyn DeviceSessions>,
        orchestrator: Arc<BlastOrchestrator>,
    ) -> Self {
        Self {
            db,
            sessions,
            orchestrator,
        }
    }

    /// Starts `blast` if it is due at `now` and its device is connected.
    ///
    /// # Errors
    ///
    /// Whatever [`BlastOrchestrator::process`] returns for a blast that
    /// passed the gate.
    pub async fn start_if_ready(
        &self,
        blast: &Blast,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, DeliveryError> {
        if blast.scheduled_at > now {
            return Ok(StartOutcome::NotDue);
        }
        if self
            .sessions
            .connected_session(&blast.device_key)
            .await
            .is_none()
        {
            debug!(
                blast_id = blast.id,
                device = %blast.device_key,
                "device not connected; blast stays pending"
            );
            return Ok(StartOutcome::DeviceNotConnected);
        }
        let run = self.orchestrator.process(blast.id).await?;
        Ok(StartOutcome::Started(run))
    }

    /// Starts every due blast whose device is connected.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<TriggerReport, StoreError> {
        let mut report = TriggerReport::default();
        for blast in self.db.due_blasts(now)? {
            match self.start_if_ready(&blast, now).await {
                Ok(StartOutcome::Started(run)) => {
                    info!(blast_id = blast.id, recipients = run.len(), "scheduled blast started");
                    report.dispatched.push(blast.id);
                }
                Ok(StartOutcome::NotDue | StartOutcome::DeviceNotConnected) => {
                    report.skipped.push(blast.id);
                }
                Err(DeliveryError::NotPending { .. }) => {
                    debug!(blast_id = blast.id, "blast was claimed elsewhere");
                }
                Err(DeliveryError::Store(e)) => return Err(e),
                Err(e) => warn!(blast_id = blast.id, "could not start blast: {e}"),
            }
        }
        Ok(report)
    }

    /// Runs [`dispatch_due`](Self::dispatch_due) every `interval` until the
    /// returned task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.dispatch_due(Utc::now()).await {
                    error!("blast trigger tick failed: {e}");
                }
            }
        })
    }
}
