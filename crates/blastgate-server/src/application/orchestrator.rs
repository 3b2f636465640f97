//! Blast delivery orchestrator.
//!
//! # How a blast is sent (for beginners)
//!
//! Processing a blast does not send anything itself.  It claims the blast
//! (`pending` → `processing`), draws a send offset for every pending
//! recipient and spawns one task per recipient:
//!
//! ```text
//!   process(blast)
//!     │  offsets = [0s, 7s, 19s, 25s]   (accumulated jitter)
//!     ├── task A: sleep 0s  ─▶ send ─▶ record
//!     ├── task B: sleep 7s  ─▶ send ─▶ (fail, wait, retry) ─▶ record
//!     ├── task C: sleep 19s ─▶ device gone ─▶ record "not connected"
//!     └── task D: sleep 25s ─▶ send ─▶ record
//! ```
//!
//! The tasks run concurrently, so one slow recipient never delays another.
//! Each task checks that its recipient is still pending before sending (the
//! blast may have been deleted in the meantime) and asks for the device's
//! session on every attempt, because the device can disconnect while the
//! blast is running.  Outcomes flow into the [`OutcomeAggregator`], which
//! derives the blast's final status.

use std::sync::Arc;

use async_trait::async_trait;
use blastgate_core::{
    Blast, BlastId, BlastStatus, DeliveryOutcome, DeliveryPolicy, DeviceKey, JitterPacing,
    MessagePayload, Recipient, RecipientStatus,
};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::aggregator::OutcomeAggregator;
use crate::infrastructure::storage::{Database, StoreError};
use crate::infrastructure::transport::SessionHandle;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("blast {0} not found")]
    BlastNotFound(BlastId),

    #[error("blast {id} is {status}, only pending blasts can be processed")]
    NotPending { id: BlastId, status: BlastStatus },

    #[error("blast {id} is still {status}")]
    BlastBusy { id: BlastId, status: BlastStatus },

    #[error("blast {0} has no failed recipients")]
    NothingToRetry(BlastId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Source of connected device sessions.
#[async_trait]
pub trait DeviceSessions: Send + Sync {
    /// The session of `key`, only if the device is connected right now.
    async fn connected_session(&self, key: &DeviceKey) -> Option<Arc<dyn SessionHandle>>;
}

/// Handle to the recipient tasks spawned for one blast.
#[derive(Debug)]
pub struct BlastRun {
    pub blast_id: BlastId,
    tasks: Vec<JoinHandle<()>>,
}

impl BlastRun {
    fn empty(blast_id: BlastId) -> Self {
        Self {
            blast_id,
            tasks: Vec::new(),
        }
    }

    /// Number of recipient tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every recipient task to finish.
    pub async fn wait(self) {
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(blast_id = self.blast_id, "recipient task failed: {e}");
            }
        }
    }
}

pub struct BlastOrchestrator {
    db: Database,
    sessions: Arc<dyn DeviceSessions>,
    aggregator: Arc<OutcomeAggregator>,
    policy: DeliveryPolicy,
}

impl BlastOrchestrator {
    pub fn new(
        db: Database,
        sessions: Arc<dyn DeviceSessions>,
        aggregator: Arc<OutcomeAggregator>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            db,
            sessions,
            aggregator,
            policy,
        }
    }

    /// Claims a pending blast and starts delivering to its recipients.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::BlastNotFound`] or [`DeliveryError::NotPending`] when
    /// the blast cannot be claimed; storage errors otherwise.
    pub async fn process(&self, blast_id: BlastId) -> Result<BlastRun, DeliveryError> {
        let blast = self
            .db
            .blast(blast_id)?
            .ok_or(DeliveryError::BlastNotFound(blast_id))?;
        if blast.status != BlastStatus::Pending || !self.db.begin_processing(blast_id)? {
            let status = self
                .db
                .blast(blast_id)?
                .map_or(blast.status, |b| b.status);
            return Err(DeliveryError::NotPending {
                id: blast_id,
                status,
            });
        }

        match self.start_claimed(&blast).await {
            Ok(run) => Ok(run),
            Err(e) => {
                // Hand the claim back so the next tick can try again.
                match self.db.release_processing(blast_id) {
                    Ok(released) => warn!(blast_id, released, "could not start blast: {e}"),
                    Err(release) => {
                        error!(blast_id, "could not start blast: {e}; release failed: {release}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn start_claimed(&self, blast: &Blast) -> Result<BlastRun, DeliveryError> {
        let blast_id = blast.id;
        let recipients = self.db.pending_recipients(blast_id)?;
        if recipients.is_empty() {
            let finished = self.aggregator.finish_if_settled(blast_id).await?;
            info!(blast_id, ?finished, "blast has no pending recipients");
            return Ok(BlastRun::empty(blast_id));
        }

        info!(
            blast_id,
            device = %blast.device_key,
            recipients = recipients.len(),
            "processing blast"
        );
        Ok(self.dispatch(blast, recipients))
    }

    /// Resets the failed recipients of a settled blast and delivers to them
    /// again.
    pub async fn retry_failed(&self, blast_id: BlastId) -> Result<BlastRun, DeliveryError> {
        let recipients = self.aggregator.reset_failed(blast_id).await?;
        let blast = self
            .db
            .blast(blast_id)?
            .ok_or(DeliveryError::BlastNotFound(blast_id))?;
        info!(blast_id, recipients = recipients.len(), "retrying failed recipients");
        Ok(self.dispatch(&blast, recipients))
    }

    fn dispatch(&self, blast: &Blast, recipients: Vec<Recipient>) -> BlastRun {
        let pacing = match JitterPacing::new(blast.delay_min_secs, blast.delay_max_secs) {
            Ok(pacing) => pacing,
            Err(e) => {
                warn!(blast_id = blast.id, "{e}; using swapped bounds");
                JitterPacing::ordered(blast.delay_min_secs, blast.delay_max_secs)
            }
        };
        let offsets = pacing.schedule(recipients.len(), &mut rand::thread_rng());

        let context = Arc::new(DeliveryContext {
            blast_id: blast.id,
            device_key: blast.device_key.clone(),
            payload: MessagePayload::compose(&blast.message, blast.media_url.as_deref(), None),
            db: self.db.clone(),
            sessions: Arc::clone(&self.sessions),
            aggregator: Arc::clone(&self.aggregator),
            policy: self.policy,
        });

        let start = Instant::now();
        let tasks = recipients
            .into_iter()
            .zip(offsets)
            .map(|(recipient, offset)| {
                tokio::spawn(Arc::clone(&context).deliver(recipient, start + offset))
            })
            .collect();
        BlastRun {
            blast_id: blast.id,
            tasks,
        }
    }
}

// ── Recipient task ────────────────────────────────────────────────────────────

struct DeliveryContext {
    blast_id: BlastId,
    device_key: DeviceKey,
    payload: MessagePayload,
    db: Database,
    sessions: Arc<dyn DeviceSessions>,
    aggregator: Arc<OutcomeAggregator>,
    policy: DeliveryPolicy,
}

impl DeliveryContext {
    async fn deliver(self: Arc<Self>, recipient: Recipient, at: Instant) {
        sleep_until(at).await;

        match self.db.recipient(recipient.id) {
            Ok(Some(current)) if current.status == RecipientStatus::Pending => {}
            Ok(_) => {
                debug!(
                    blast_id = self.blast_id,
                    recipient_id = recipient.id,
                    "recipient no longer pending; skipping"
                );
                return;
            }
            Err(e) => {
                error!(recipient_id = recipient.id, "could not load recipient: {e}");
                return;
            }
        }

        let outcome = self.attempt(&recipient).await;
        if let Err(e) = self
            .aggregator
            .record(self.blast_id, recipient.id, &outcome)
            .await
        {
            error!(
                blast_id = self.blast_id,
                recipient_id = recipient.id,
                "could not record outcome: {e}"
            );
        }
    }

    async fn attempt(&self, recipient: &Recipient) -> DeliveryOutcome {
        let chat_id = recipient.chat_id();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let Some(session) = self.sessions.connected_session(&self.device_key).await else {
                warn!(
                    blast_id = self.blast_id,
                    recipient = %recipient.phone_number,
                    "device {} is not connected",
                    self.device_key
                );
                return DeliveryOutcome::device_not_connected();
            };

            match timeout(
                self.policy.send_timeout,
                session.send_message(&chat_id, &self.payload),
            )
            .await
            {
                Ok(Ok(receipt)) => {
                    debug!(
                        blast_id = self.blast_id,
                        recipient = %recipient.phone_number,
                        message_id = %receipt.message_id,
                        attempt,
                        "message sent"
                    );
                    return DeliveryOutcome::Sent;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "send timed out after {}s",
                        self.policy.send_timeout.as_secs()
                    );
                }
            }

            warn!(
                blast_id = self.blast_id,
                recipient = %recipient.phone_number,
                attempt,
                max_attempts,
                "send failed: {last_error}"
            );
            if attempt < max_attempts {
                sleep(self.policy.retry_backoff).await;
            }
        }
        DeliveryOutcome::failed(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::mock::{MockSend, MockTransport};
    use crate::infrastructure::transport::Transport;
    use blastgate_core::{NewBlast, DEVICE_NOT_CONNECTED};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Hands out a fixed session, or none.
    struct FixedSessions(Mutex<Option<Arc<dyn SessionHandle>>>);

    #[async_trait]
    impl DeviceSessions for FixedSessions {
        async fn connected_session(&self, _key: &DeviceKey) -> Option<Arc<dyn SessionHandle>> {
            self.0.lock().clone()
        }
    }

    struct Fixture {
        orchestrator: BlastOrchestrator,
        transport: MockTransport,
        db: Database,
        key: DeviceKey,
        _tmp: tempfile::TempDir,
    }

    async fn fixture(connected: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        let key = db.create_device("Sales").unwrap().key;
        let transport = MockTransport::new();
        let session = if connected {
            Some(transport.connect(&key, tmp.path()).await.unwrap().handle)
        } else {
            None
        };
        let policy = DeliveryPolicy {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
        };
        let orchestrator = BlastOrchestrator::new(
            db.clone(),
            Arc::new(FixedSessions(Mutex::new(session))),
            Arc::new(OutcomeAggregator::new(db.clone())),
            policy,
        );
        Fixture {
            orchestrator,
            transport,
            db,
            key,
            _tmp: tmp,
        }
    }

    fn create_blast(fx: &Fixture, numbers: &[&str]) -> BlastId {
        fx.db
            .create_blast(&NewBlast {
                device_key: fx.key.clone(),
                name: "launch".to_string(),
                message: "Hello!".to_string(),
                media_url: None,
                delay_min_secs: 0,
                delay_max_secs: 0,
                scheduled_at: Utc::now(),
                recipients: numbers.iter().map(|n| n.to_string()).collect(),
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_unknown_blast_is_rejected() {
        let fx = fixture(true).await;
        assert!(matches!(
            fx.orchestrator.process(42).await,
            Err(DeliveryError::BlastNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_blast_is_claimed_once() {
        let fx = fixture(true).await;
        let id = create_blast(&fx, &["62811"]);

        let run = fx.orchestrator.process(id).await.unwrap();
        let second = fx.orchestrator.process(id).await;
        run.wait().await;

        assert!(matches!(second, Err(DeliveryError::NotPending { .. })));
    }

    #[tokio::test]
    async fn test_failed_start_hands_blast_back_to_pending() {
        // Arrange: recipient rows that cannot be read
        let fx = fixture(true).await;
        let id = create_blast(&fx, &["62811"]);
        fx.db
            .execute_raw("UPDATE recipients SET sent_at = 'not a time'")
            .unwrap();

        // Act
        let result = fx.orchestrator.process(id).await;

        // Assert: the claim is released and a later run can pick it up
        assert!(matches!(result, Err(DeliveryError::Store(_))));
        assert_eq!(fx.db.blast(id).unwrap().unwrap().status, BlastStatus::Pending);
        fx.db
            .execute_raw("UPDATE recipients SET sent_at = NULL")
            .unwrap();
        fx.orchestrator.process(id).await.unwrap().wait().await;
        assert_eq!(fx.db.blast(id).unwrap().unwrap().status, BlastStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_blast_completes_immediately() {
        let fx = fixture(true).await;
        let id = create_blast(&fx, &[]);

        let run = fx.orchestrator.process(id).await.unwrap();

        assert!(run.is_empty());
        let blast = fx.db.blast(id).unwrap().unwrap();
        assert_eq!(blast.status, BlastStatus::Completed);
        assert_eq!(blast.counters.total, 0);
    }

    #[tokio::test]
    async fn test_all_recipients_sent() {
        // Arrange
        let fx = fixture(true).await;
        let id = create_blast(&fx, &["62811", "62812", "+62 813"]);

        // Act
        fx.orchestrator.process(id).await.unwrap().wait().await;

        // Assert
        let blast = fx.db.blast(id).unwrap().unwrap();
        assert_eq!(blast.status, BlastStatus::Completed);
        assert_eq!(blast.counters.sent, 3);
        let chats: Vec<String> = fx
            .transport
            .sent_messages()
            .into_iter()
            .map(|m| m.chat_id)
            .collect();
        assert!(chats.contains(&"62813@s.whatsapp.net".to_string()));
        assert!(fx
            .db
            .recipients(id)
            .unwrap()
            .iter()
            .all(|r| r.sent_at.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_records_last_error() {
        let fx = fixture(true).await;
        let id = create_blast(&fx, &["62811"]);
        fx.transport
            .set_default_send(MockSend::Fail("rate limited".to_string()));

        fx.orchestrator.process(id).await.unwrap().wait().await;

        assert_eq!(fx.transport.send_attempts("62811@s.whatsapp.net"), 3);
        let blast = fx.db.blast(id).unwrap().unwrap();
        assert_eq!(blast.status, BlastStatus::Failed);
        let recipient = &fx.db.recipients(id).unwrap()[0];
        assert_eq!(recipient.status, RecipientStatus::Failed);
        assert_eq!(recipient.error_message.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn test_disconnected_device_fails_without_retry() {
        let fx = fixture(false).await;
        let id = create_blast(&fx, &["62811", "62812"]);

        fx.orchestrator.process(id).await.unwrap().wait().await;

        let blast = fx.db.blast(id).unwrap().unwrap();
        assert_eq!(blast.status, BlastStatus::Failed);
        assert_eq!(blast.counters.failed, 2);
        assert!(fx
            .db
            .recipients(id)
            .unwrap()
            .iter()
            .all(|r| r.error_message.as_deref() == Some(DEVICE_NOT_CONNECTED)));
        assert_eq!(fx.transport.send_attempts("62811@s.whatsapp.net"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_resends_only_failed() {
        // Arrange
        let fx = fixture(true).await;
        let id = create_blast(&fx, &["62811", "62812"]);
        fx.transport.script_send(
            "62812@s.whatsapp.net",
            std::iter::repeat(MockSend::Fail("offline".to_string())).take(3),
        );
        fx.orchestrator.process(id).await.unwrap().wait().await;
        assert_eq!(fx.db.blast(id).unwrap().unwrap().counters.failed, 1);

        // Act
        let run = fx.orchestrator.retry_failed(id).await.unwrap();
        assert_eq!(run.len(), 1);
        run.wait().await;

        // Assert
        let blast = fx.db.blast(id).unwrap().unwrap();
        assert_eq!(blast.status, BlastStatus::Completed);
        assert_eq!(blast.counters.sent, 2);
        assert_eq!(blast.counters.failed, 0);
        assert_eq!(fx.transport.send_attempts("62811@s.whatsapp.net"), 1);
    }
}
