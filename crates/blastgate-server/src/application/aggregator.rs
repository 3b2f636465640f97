//! Per-blast outcome aggregation.
//!
//! Recipient tasks of one blast finish in any order and on any worker
//! thread.  Each outcome goes through [`OutcomeAggregator::record`], which
//! holds the blast's lock while the recipient row and the counters are
//! updated in one transaction, so the counters always match the recipient
//! rows and the terminal status is written exactly once.

use blastgate_core::{BlastId, BlastStatus, DeliveryOutcome, Recipient, RecipientId};
use chrono::Utc;
use tracing::{debug, info};

use super::keyed::KeyedMutex;
use super::orchestrator::DeliveryError;
use crate::infrastructure::storage::{Database, RecordedOutcome, ResetOutcome, StoreError};

pub struct OutcomeAggregator {
    db: Database,
    locks: KeyedMutex<BlastId>,
}

impl OutcomeAggregator {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: KeyedMutex::new(),
        }
    }

    /// Records the final outcome of one recipient.
    ///
    /// Returns `None` when the recipient already had an outcome or no longer
    /// exists; the counters are left alone in that case.
    pub async fn record(
        &self,
        blast_id: BlastId,
        recipient_id: RecipientId,
        outcome: &DeliveryOutcome,
    ) -> Result<Option<RecordedOutcome>, StoreError> {
        let recorded = {
            let _guard = self.locks.lock(&blast_id).await;
            self.db.record_outcome(recipient_id, outcome, Utc::now())?
        };
        match &recorded {
            Some(RecordedOutcome {
                counters,
                finished: Some(status),
                ..
            }) => {
                info!(
                    blast_id,
                    sent = counters.sent,
                    failed = counters.failed,
                    total = counters.total,
                    "blast finished as {}",
                    status.as_str()
                );
                self.locks.prune();
            }
            Some(_) => {}
            None => debug!(blast_id, recipient_id, "outcome for settled recipient ignored"),
        }
        Ok(recorded)
    }

    /// Writes the terminal status of a blast with nothing left to send.
    pub async fn finish_if_settled(
        &self,
        blast_id: BlastId,
    ) -> Result<Option<BlastStatus>, StoreError> {
        let _guard = self.locks.lock(&blast_id).await;
        self.db.finish_if_settled(blast_id)
    }

    /// Puts the failed recipients of a settled blast back to pending and
    /// returns them.
    pub async fn reset_failed(&self, blast_id: BlastId) -> Result<Vec<Recipient>, DeliveryError> {
        let outcome = {
            let _guard = self.locks.lock(&blast_id).await;
            self.db.reset_failed(blast_id)?
        };
        match outcome {
            ResetOutcome::BlastNotFound => Err(DeliveryError::BlastNotFound(blast_id)),
            ResetOutcome::Busy(status) => Err(DeliveryError::BlastBusy {
                id: blast_id,
                status,
            }),
            ResetOutcome::NothingToRetry => Err(DeliveryError::NothingToRetry(blast_id)),
            ResetOutcome::Reset(recipients) => {
                info!(blast_id, count = recipients.len(), "failed recipients reset");
                Ok(recipients)
            }
        }
    }
}
