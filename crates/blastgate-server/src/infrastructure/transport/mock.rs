//! In-process mock transport.
//!
//! Lets tests drive session events by hand ([`MockTransport::emit`]), script
//! per-chat send results ([`MockSend`]) and observe every connect and send.
//!
//! With [`MockTransport::with_auto_pairing`] it also simulates a phone: every
//! new session issues a pairing code, "scans" it after a delay and then keeps
//! a `creds.json` file in the session directory, so a later connect opens
//! straight away as a restored session would.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blastgate_core::{AccountInfo, DeviceKey, MessagePayload};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{Connection, SendReceipt, SessionHandle, Transport, TransportError, TransportEvent};

const EVENT_BUFFER: usize = 32;
const CREDENTIALS_FILE: &str = "creds.json";

/// Scripted result of one `send_message` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockSend {
    Deliver,
    Fail(String),
    /// Never completes; exercises send timeouts.
    Hang,
}

/// A message the mock accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub key: DeviceKey,
    pub chat_id: String,
    pub payload: MessagePayload,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct AutoPairing {
    scan_after: Option<Duration>,
}

struct ConnectRecord {
    key: DeviceKey,
    at: Instant,
    events: mpsc::Sender<TransportEvent>,
    session: Arc<MockSession>,
}

#[derive(Default)]
struct MockState {
    connects: Vec<ConnectRecord>,
    failing_connects: u32,
    connect_delay: Duration,
    send_script: HashMap<String, VecDeque<MockSend>>,
    default_send: Option<MockSend>,
    send_attempts: HashMap<String, u32>,
    sent: Vec<SentMessage>,
}

/// Mock implementation of [`Transport`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    connected: Arc<Notify>,
    auto_pairing: Option<AutoPairing>,
    message_ids: Arc<AtomicU64>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a phone: issue a code on every new session and scan it after
    /// `scan_after` (never, when `None`).
    pub fn with_auto_pairing(scan_after: Option<Duration>) -> Self {
        Self {
            auto_pairing: Some(AutoPairing { scan_after }),
            ..Self::default()
        }
    }

    /// Makes the next `n` connects fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    /// Makes every connect take `delay` before it answers.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Queues send results for `chat_id`; once used up, the default applies.
    pub fn script_send(&self, chat_id: &str, results: impl IntoIterator<Item = MockSend>) {
        self.state
            .lock()
            .send_script
            .entry(chat_id.to_string())
            .or_default()
            .extend(results);
    }

    /// Result for unscripted sends.  Deliver unless set.
    pub fn set_default_send(&self, result: MockSend) {
        self.state.lock().default_send = Some(result);
    }

    pub fn connect_count(&self, key: &DeviceKey) -> usize {
        self.state
            .lock()
            .connects
            .iter()
            .filter(|c| &c.key == key)
            .count()
    }

    pub fn connect_times(&self, key: &DeviceKey) -> Vec<Instant> {
        self.state
            .lock()
            .connects
            .iter()
            .filter(|c| &c.key == key)
            .map(|c| c.at)
            .collect()
    }

    /// Waits until `key` has been connected at least `n` times.
    pub async fn wait_for_connects(&self, key: &DeviceKey, n: usize) {
        loop {
            let notified = self.connected.notified();
            if self.connect_count(key) >= n {
                return;
            }
            notified.await;
        }
    }

    /// Latest session opened for `key`.
    pub fn session(&self, key: &DeviceKey) -> Option<Arc<MockSession>> {
        self.state
            .lock()
            .connects
            .iter()
            .rev()
            .find(|c| &c.key == key)
            .map(|c| Arc::clone(&c.session))
    }

    /// Delivers `event` on the latest session of `key`.  Returns `false` if
    /// there is none or nobody is listening any more.
    pub async fn emit(&self, key: &DeviceKey, event: TransportEvent) -> bool {
        let target = {
            let state = self.state.lock();
            state
                .connects
                .iter()
                .rev()
                .find(|c| &c.key == key)
                .map(|c| (c.events.clone(), Arc::clone(&c.session)))
        };
        let Some((events, session)) = target else {
            return false;
        };
        if let TransportEvent::Opened(account) = &event {
            *session.account.lock() = Some(account.clone());
        }
        events.send(event).await.is_ok()
    }

    /// Delivers `event` on the `index`-th (0-based) session ever opened for
    /// `key`.
    pub async fn emit_nth(&self, key: &DeviceKey, index: usize, event: TransportEvent) -> bool {
        let events = {
            let state = self.state.lock();
            state
                .connects
                .iter()
                .filter(|c| &c.key == key)
                .nth(index)
                .map(|c| c.events.clone())
        };
        match events {
            Some(events) => events.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    /// Number of `send_message` calls made for `chat_id`, successful or not.
    pub fn send_attempts(&self, chat_id: &str) -> u32 {
        self.state
            .lock()
            .send_attempts
            .get(chat_id)
            .copied()
            .unwrap_or(0)
    }

    fn spawn_pairing(
        key: DeviceKey,
        dir: &Path,
        pairing: AutoPairing,
        session: Arc<MockSession>,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let creds = dir.join(CREDENTIALS_FILE);
        tokio::spawn(async move {
            let account = AccountInfo::new(simulated_jid(&key), Some("Simulated".to_string()));
            if !creds.exists() {
                let code = format!("2@{}", DeviceKey::generate());
                if events.send(TransportEvent::QrIssued(code)).await.is_err() {
                    return;
                }
                let Some(scan_after) = pairing.scan_after else {
                    return;
                };
                tokio::time::sleep(scan_after).await;
                if session.is_closed() {
                    return;
                }
                if let Err(e) = tokio::fs::write(&creds, b"{}").await {
                    debug!("mock pairing could not persist credentials for {key}: {e}");
                }
            }
            *session.account.lock() = Some(account.clone());
            let _ = events.send(TransportEvent::Opened(account)).await;
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        key: &DeviceKey,
        session_dir: &Path,
    ) -> Result<Connection, TransportError> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = Arc::new(MockSession {
            key: key.clone(),
            closed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            account: Mutex::new(None),
            state: Arc::clone(&self.state),
            message_ids: Arc::clone(&self.message_ids),
        });

        {
            let mut state = self.state.lock();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::Connect("simulated connect failure".to_string()));
            }
            state.connects.push(ConnectRecord {
                key: key.clone(),
                at: Instant::now(),
                events: tx.clone(),
                session: Arc::clone(&session),
            });
        }
        self.connected.notify_waiters();
        debug!("mock transport connected {key}");

        if let Some(pairing) = self.auto_pairing {
            Self::spawn_pairing(key.clone(), session_dir, pairing, Arc::clone(&session), tx);
        }

        Ok(Connection {
            handle: session,
            events: rx,
        })
    }
}

/// Session handed out by [`MockTransport`].
pub struct MockSession {
    key: DeviceKey,
    closed: AtomicBool,
    logged_out: AtomicBool,
    account: Mutex<Option<AccountInfo>>,
    state: Arc<Mutex<MockState>>,
    message_ids: Arc<AtomicU64>,
}

impl MockSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandle for MockSession {
    async fn send_message(
        &self,
        chat_id: &str,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let result = {
            let mut state = self.state.lock();
            *state.send_attempts.entry(chat_id.to_string()).or_default() += 1;
            let scripted = state
                .send_script
                .get_mut(chat_id)
                .and_then(VecDeque::pop_front);
            scripted
                .or_else(|| state.default_send.clone())
                .unwrap_or(MockSend::Deliver)
        };

        match result {
            MockSend::Deliver => {
                self.state.lock().sent.push(SentMessage {
                    key: self.key.clone(),
                    chat_id: chat_id.to_string(),
                    payload: payload.clone(),
                    at: Instant::now(),
                });
                let id = self.message_ids.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(SendReceipt {
                    message_id: format!("MOCK{id:08}"),
                })
            }
            MockSend::Fail(reason) => Err(TransportError::Send(reason)),
            MockSend::Hang => std::future::pending().await,
        }
    }

    async fn logout(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.logged_out.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn account(&self) -> Option<AccountInfo> {
        self.account.lock().clone()
    }
}

/// Stable fake address derived from the device key.
fn simulated_jid(key: &DeviceKey) -> String {
    let digits: String = key
        .as_str()
        .bytes()
        .map(|b| char::from(b'0' + b % 10))
        .take(10)
        .collect();
    format!("62{digits}:1@s.whatsapp.net")
}
