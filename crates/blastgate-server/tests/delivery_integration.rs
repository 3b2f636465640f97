//! Integration tests for blast delivery.
//!
//! Each test runs a blast end to end (orchestrator, aggregator, SQLite)
//! against the mock transport with Tokio's clock paused, so pacing and retry
//! waits happen in simulated time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blastgate_core::{
    BlastId, BlastStatus, DeliveryPolicy, DeviceKey, NewBlast, RecipientStatus,
    DEVICE_NOT_CONNECTED,
};
use blastgate_server::application::aggregator::OutcomeAggregator;
use blastgate_server::application::orchestrator::{
    BlastOrchestrator, DeliveryError, DeviceSessions,
};
use blastgate_server::infrastructure::storage::Database;
use blastgate_server::infrastructure::transport::mock::{MockSend, MockTransport};
use blastgate_server::infrastructure::transport::{SessionHandle, Transport};
use chrono::Utc;
use tokio::time::Instant;

/// Device session that is missing during `[offline_from, offline_until)`
/// after `start`.
struct FlakyDevice {
    session: Arc<dyn SessionHandle>,
    start: Instant,
    offline_from: Duration,
    offline_until: Duration,
}

#[async_trait]
impl DeviceSessions for FlakyDevice {
    async fn connected_session(&self, _key: &DeviceKey) -> Option<Arc<dyn SessionHandle>> {
        let elapsed = self.start.elapsed();
        if elapsed >= self.offline_from && elapsed < self.offline_until {
            None
        } else {
            Some(Arc::clone(&self.session))
        }
    }
}

struct Harness {
    orchestrator: BlastOrchestrator,
    transport: MockTransport,
    db: Database,
    key: DeviceKey,
    _sessions: tempfile::TempDir,
}

fn policy() -> DeliveryPolicy {
    DeliveryPolicy {
        max_attempts: 3,
        retry_backoff: Duration::from_secs(1),
        send_timeout: Duration::from_secs(30),
    }
}

/// Device online except during the given window (relative to now).
async fn harness_with_outage(offline: Option<(u64, u64)>) -> Harness {
    let sessions = tempfile::tempdir().unwrap();
    let db = Database::in_memory().unwrap();
    let key = db.create_device("Marketing").unwrap().key;
    let transport = MockTransport::new();
    let session = transport.connect(&key, sessions.path()).await.unwrap().handle;
    let (from, until) = offline.unwrap_or((0, 0));
    let device = FlakyDevice {
        session,
        start: Instant::now(),
        offline_from: Duration::from_secs(from),
        offline_until: Duration::from_secs(until),
    };
    let orchestrator = BlastOrchestrator::new(
        db.clone(),
        Arc::new(device),
        Arc::new(OutcomeAggregator::new(db.clone())),
        policy(),
    );
    Harness {
        orchestrator,
        transport,
        db,
        key,
        _sessions: sessions,
    }
}

async fn harness() -> Harness {
    harness_with_outage(None).await
}

impl Harness {
    fn blast(&self, numbers: &[&str], delay_secs: u32) -> BlastId {
        self.db
            .create_blast(&NewBlast {
                device_key: self.key.clone(),
                name: "spring sale".to_string(),
                message: "20% off today".to_string(),
                media_url: None,
                delay_min_secs: delay_secs,
                delay_max_secs: delay_secs,
                scheduled_at: Utc::now(),
                recipients: numbers.iter().map(|n| n.to_string()).collect(),
            })
            .unwrap()
            .id
    }

    fn recipient_status(&self, blast_id: BlastId, phone: &str) -> (RecipientStatus, Option<String>) {
        let recipient = self
            .db
            .recipients(blast_id)
            .unwrap()
            .into_iter()
            .find(|r| r.phone_number == phone)
            .unwrap();
        (recipient.status, recipient.error_message)
    }
}

fn chat(phone: &str) -> String {
    format!("{phone}@s.whatsapp.net")
}

// ── Mixed outcomes ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_retry_outage_and_success_mix_completes() {
    // Arrange: A fails twice then succeeds, B is due during a device outage,
    // C goes through first time
    let h = harness_with_outage(Some((5, 15))).await;
    let id = h.blast(&["6281001", "6281002", "6281003"], 10);
    h.transport.script_send(
        &chat("6281001"),
        [
            MockSend::Fail("timeout".to_string()),
            MockSend::Fail("timeout".to_string()),
            MockSend::Deliver,
        ],
    );

    // Act
    h.orchestrator.process(id).await.unwrap().wait().await;

    // Assert
    let blast = h.db.blast(id).unwrap().unwrap();
    assert_eq!(blast.status, BlastStatus::Completed);
    assert_eq!((blast.counters.sent, blast.counters.failed), (2, 1));
    assert_eq!(h.transport.send_attempts(&chat("6281001")), 3);
    assert_eq!(h.transport.send_attempts(&chat("6281002")), 0);
    assert_eq!(
        h.recipient_status(id, "6281002"),
        (RecipientStatus::Failed, Some(DEVICE_NOT_CONNECTED.to_string()))
    );
    assert_eq!(h.recipient_status(id, "6281003").0, RecipientStatus::Sent);
}

#[tokio::test(start_paused = true)]
async fn test_every_recipient_failing_fails_the_blast() {
    let h = harness().await;
    let id = h.blast(&["6281001", "6281002"], 0);
    h.transport
        .set_default_send(MockSend::Fail("not on the network".to_string()));

    h.orchestrator.process(id).await.unwrap().wait().await;

    let blast = h.db.blast(id).unwrap().unwrap();
    assert_eq!(blast.status, BlastStatus::Failed);
    assert_eq!(blast.counters.failed, 2);
    assert_eq!(
        h.recipient_status(id, "6281001").1.as_deref(),
        Some("not on the network")
    );
}

#[tokio::test(start_paused = true)]
async fn test_hanging_send_times_out() {
    let h = harness().await;
    let id = h.blast(&["6281001"], 0);
    h.transport.set_default_send(MockSend::Hang);
    let start = Instant::now();

    h.orchestrator.process(id).await.unwrap().wait().await;

    // Three 30 s timeouts with two 1 s waits in between
    assert_eq!(start.elapsed(), Duration::from_secs(92));
    let (status, error) = h.recipient_status(id, "6281001");
    assert_eq!(status, RecipientStatus::Failed);
    assert_eq!(error.as_deref(), Some("send timed out after 30s"));
}

// ── Pacing and concurrency ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_sends_follow_the_pacing_schedule() {
    let h = harness().await;
    let id = h.blast(&["6281001", "6281002", "6281003", "6281004"], 7);
    let start = Instant::now();

    h.orchestrator.process(id).await.unwrap().wait().await;

    let offsets: Vec<u64> = h
        .transport
        .sent_messages()
        .iter()
        .map(|m| (m.at - start).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 7, 14, 21]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_recipient_does_not_delay_others() {
    // Arrange: the first recipient hangs for its whole retry budget
    let h = harness().await;
    let id = h.blast(&["6281001", "6281002"], 5);
    h.transport
        .script_send(&chat("6281001"), std::iter::repeat(MockSend::Hang).take(3));
    let start = Instant::now();

    // Act
    h.orchestrator.process(id).await.unwrap().wait().await;

    // Assert: the second send still happens at its 5 s slot
    let sent = h.transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, chat("6281002"));
    assert_eq!(sent[0].at - start, Duration::from_secs(5));
}

// ── Lifecycle of a blast ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_empty_blast_completes_without_sending() {
    let h = harness().await;
    let id = h.blast(&[], 5);

    let run = h.orchestrator.process(id).await.unwrap();

    assert!(run.is_empty());
    assert_eq!(h.db.blast(id).unwrap().unwrap().status, BlastStatus::Completed);
    assert!(h.transport.sent_messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_rejected_while_processing() {
    let h = harness().await;
    let id = h.blast(&["6281001"], 0);
    h.transport.set_default_send(MockSend::Hang);

    let run = h.orchestrator.process(id).await.unwrap();
    let retry = h.orchestrator.retry_failed(id).await;

    assert!(matches!(
        retry,
        Err(DeliveryError::BlastBusy {
            status: BlastStatus::Processing,
            ..
        })
    ));
    run.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_failed_after_outage_recovers() {
    // Arrange: the device is offline for the first minute
    let h = harness_with_outage(Some((0, 60))).await;
    let id = h.blast(&["6281001", "6281002"], 1);
    h.orchestrator.process(id).await.unwrap().wait().await;
    assert_eq!(h.db.blast(id).unwrap().unwrap().status, BlastStatus::Failed);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Act
    h.orchestrator.retry_failed(id).await.unwrap().wait().await;

    // Assert
    let blast = h.db.blast(id).unwrap().unwrap();
    assert_eq!(blast.status, BlastStatus::Completed);
    assert_eq!((blast.counters.sent, blast.counters.failed), (2, 0));
    assert!(h
        .db
        .recipients(id)
        .unwrap()
        .iter()
        .all(|r| r.error_message.is_none() && r.sent_at.is_some()));
}

#[tokio::test(start_paused = true)]
async fn test_deleted_blast_stops_sending() {
    let h = harness().await;
    let id = h.blast(&["6281001", "6281002"], 10);

    let run = h.orchestrator.process(id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.db.delete_blast(id).unwrap());
    run.wait().await;

    let sent = h.transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, chat("6281001"));
}
