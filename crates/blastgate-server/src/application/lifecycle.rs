//! Device connection lifecycle manager.
//!
//! # How a device moves between states (for beginners)
//!
//! Every device runs through the same small state machine:
//!
//! ```text
//!                 connect / login
//!   Disconnected ───────────────▶ Connecting ──Opened──▶ Connected
//!        ▲                            │                     │
//!        │        terminal close      │                     │
//!        ├────────────────────────────┴─────────────────────┤
//!        │        transient close: wait 2^n s (≤ 60 s),      │
//!        └──────── then back to Connecting (≤ 10 times) ─────┘
//! ```
//!
//! # One actor per device
//!
//! Session events arrive on transport tasks, HTTP requests on axum tasks and
//! reconnect timers fire on their own tasks.  Rather than letting all of them
//! mutate a device's state, each device gets a single *actor* task that owns
//! that state and processes one message at a time:
//!
//! ```text
//!   HTTP handlers ──Command──┐
//!   reconnect timer ─────────┼──▶ DeviceActor { generation, epoch, tracker }
//!   session pump ──SessionEvent┘        │
//!                                       ├──▶ SessionRegistry (acquire/release)
//!                                       └──▶ StatusBridge (persist, notify)
//! ```
//!
//! Two counters keep late messages harmless:
//!
//! - **generation** – the registry's number for the current session.  Events
//!   from an older session are ignored.
//! - **epoch** – bumped whenever a pending reconnect timer must not fire any
//!   more (login, logout, terminal close, a new session).  A timer that wakes
//!   with an old epoch does nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blastgate_core::{
    render_pairing_code, AccountInfo, Device, DeviceKey, DeviceStatus, DisconnectReason,
    PairingError, ReconnectDecision, ReconnectPolicy, ReconnectTracker, TerminalReason,
};
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::orchestrator::DeviceSessions;
use super::status_bridge::{StatusBridge, StatusChange, MAX_RECONNECT_REACHED};
use crate::infrastructure::session::{SessionEvent, SessionRegistry};
use crate::infrastructure::storage::{Database, StoreError};
use crate::infrastructure::transport::{SessionHandle, TransportError, TransportEvent};

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 64;
/// Closure code used when a reconnect attempt could not even open a session.
const CONNECT_FAILED_CODE: u16 = 0;
const PAIRING_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("device {0} not found")]
    DeviceNotFound(DeviceKey),

    #[error("device {0} is shutting down")]
    Stopped(DeviceKey),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pairing(#[from] PairingError),
}

/// Result of [`LifecycleManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// A new session was opened (as opposed to reusing the live one).
    pub created: bool,
    pub generation: u64,
}

/// What [`LifecycleManager::wait_for_pairing_code`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    /// Rendered pairing image.
    Code(String),
    /// The device connected; no code is needed.
    Connected(Device),
    /// No code appeared in time.
    Unavailable,
}

/// Result of [`LifecycleManager::restore_sessions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Command {
    Connect {
        reset: bool,
        reply: oneshot::Sender<Result<ConnectOutcome, LifecycleError>>,
    },
    Logout {
        reply: oneshot::Sender<Result<bool, LifecycleError>>,
    },
    ReconnectDue {
        epoch: u64,
    },
    Shutdown {
        purge: bool,
        reply: oneshot::Sender<()>,
    },
}

struct Shared {
    db: Database,
    registry: Arc<SessionRegistry>,
    bridge: StatusBridge,
    policy: ReconnectPolicy,
}

// ── LifecycleManager ──────────────────────────────────────────────────────────

/// Entry point for everything that changes a device's connection.
#[derive(Clone)]
pub struct LifecycleManager {
    shared: Arc<Shared>,
    actors: Arc<Mutex<HashMap<DeviceKey, mpsc::Sender<Command>>>>,
}

impl LifecycleManager {
    pub fn new(
        db: Database,
        registry: Arc<SessionRegistry>,
        bridge: StatusBridge,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                db,
                registry,
                bridge,
                policy,
            }),
            actors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn mailbox(&self, key: &DeviceKey) -> mpsc::Sender<Command> {
        let mut actors = self.actors.lock();
        if let Some(tx) = actors.get(key).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let tx = DeviceActor::spawn(key.clone(), Arc::clone(&self.shared));
        actors.insert(key.clone(), tx.clone());
        tx
    }

    async fn request<T>(
        &self,
        key: &DeviceKey,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LifecycleError> {
        let (reply, response) = oneshot::channel();
        self.mailbox(key)
            .send(command(reply))
            .await
            .map_err(|_| LifecycleError::Stopped(key.clone()))?;
        response
            .await
            .map_err(|_| LifecycleError::Stopped(key.clone()))
    }

    fn ensure_exists(&self, key: &DeviceKey) -> Result<(), LifecycleError> {
        if self.shared.db.device_exists(key)? {
            Ok(())
        } else {
            Err(LifecycleError::DeviceNotFound(key.clone()))
        }
    }

    /// Makes sure `key` has a session, opening one if needed.
    ///
    /// With `reset` (an explicit login) the current session and its stored
    /// credentials are discarded first and the reconnect budget restarts, so
    /// the device pairs from scratch.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::DeviceNotFound`] for unknown devices, or the
    /// transport/storage error that stopped the session from opening.
    pub async fn connect(
        &self,
        key: &DeviceKey,
        reset: bool,
    ) -> Result<ConnectOutcome, LifecycleError> {
        self.ensure_exists(key)?;
        self.request(key, |reply| Command::Connect { reset, reply })
            .await?
    }

    /// Logs the device out of the network and deletes its credentials.
    /// Returns whether a live session existed.
    pub async fn logout(&self, key: &DeviceKey) -> Result<bool, LifecycleError> {
        self.ensure_exists(key)?;
        self.request(key, |reply| Command::Logout { reply }).await?
    }

    /// Removes a device from storage and stops all its runtime state.
    /// Returns whether the device existed.
    ///
    /// The row goes first: an actor started by a racing `connect` finds the
    /// device gone and refuses to open a session for it.
    pub async fn delete_device(&self, key: &DeviceKey) -> Result<bool, LifecycleError> {
        let existed = self.shared.db.delete_device(key)?;
        let mailbox = self.actors.lock().remove(key);
        if let Some(mailbox) = mailbox {
            let (reply, done) = oneshot::channel();
            if mailbox
                .send(Command::Shutdown { purge: true, reply })
                .await
                .is_ok()
            {
                let _ = done.await;
            }
        }
        let registry = &self.shared.registry;
        registry.release(key).await;
        registry.forget(key);
        if let Err(e) = registry.files().purge(key) {
            warn!("could not delete session files of {key}: {e}");
        }
        if existed {
            info!("deleted device {key}");
        }
        Ok(existed)
    }

    /// Live session of `key`, whatever its persisted status.
    pub fn session(&self, key: &DeviceKey) -> Option<Arc<dyn SessionHandle>> {
        self.shared.registry.get(key)
    }

    /// `true` when the device is persisted as connected and has a live
    /// session.
    pub async fn is_connected(&self, key: &DeviceKey) -> bool {
        self.connected_session(key).await.is_some()
    }

    /// Reconnects every stored device that still has credentials on disk.
    pub async fn restore_sessions(&self) -> Result<RestoreReport, StoreError> {
        let mut report = RestoreReport::default();
        for device in self.shared.db.devices()? {
            if !self.shared.registry.files().has_credentials(&device.key) {
                report.skipped += 1;
                continue;
            }
            match self.connect(&device.key, false).await {
                Ok(_) => report.restored += 1,
                Err(e) => {
                    warn!("could not restore session of {}: {e}", device.key);
                    report.failed += 1;
                }
            }
        }
        info!(
            restored = report.restored,
            skipped = report.skipped,
            failed = report.failed,
            "session restore finished"
        );
        Ok(report)
    }

    /// Polls the persisted device until a pairing code is available, the
    /// device connects, or `timeout` elapses.
    pub async fn wait_for_pairing_code(
        &self,
        key: &DeviceKey,
        timeout: Duration,
    ) -> Result<PairingState, LifecycleError> {
        let deadline = Instant::now() + timeout;
        loop {
            let device = self
                .shared
                .db
                .device(key)?
                .ok_or_else(|| LifecycleError::DeviceNotFound(key.clone()))?;
            if device.status == DeviceStatus::Connected {
                return Ok(PairingState::Connected(device));
            }
            if let Some(code) = device.qr_code {
                return Ok(PairingState::Code(code));
            }
            if Instant::now() >= deadline {
                return Ok(PairingState::Unavailable);
            }
            tokio::time::sleep(PAIRING_POLL_INTERVAL).await;
        }
    }

    /// Closes every live session without deleting credentials.
    pub async fn shutdown(&self) {
        let mailboxes: Vec<_> = self.actors.lock().drain().map(|(_, tx)| tx).collect();
        for mailbox in mailboxes {
            let (reply, done) = oneshot::channel();
            if mailbox
                .send(Command::Shutdown {
                    purge: false,
                    reply,
                })
                .await
                .is_ok()
            {
                let _ = done.await;
            }
        }
    }
}

#[async_trait]
impl DeviceSessions for LifecycleManager {
    async fn connected_session(&self, key: &DeviceKey) -> Option<Arc<dyn SessionHandle>> {
        match self.shared.db.device(key) {
            Ok(Some(device)) if device.is_connected() => self.shared.registry.get(key),
            Ok(_) => None,
            Err(e) => {
                warn!("could not read device {key}: {e}");
                None
            }
        }
    }
}

// ── DeviceActor ───────────────────────────────────────────────────────────────

struct DeviceActor {
    key: DeviceKey,
    shared: Arc<Shared>,
    mailbox: mpsc::WeakSender<Command>,
    events_tx: mpsc::Sender<SessionEvent>,
    generation: Option<u64>,
    epoch: u64,
    tracker: ReconnectTracker,
    qr_announced: bool,
}

impl DeviceActor {
    fn spawn(key: DeviceKey, shared: Arc<Shared>) -> mpsc::Sender<Command> {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let actor = DeviceActor {
            key,
            shared,
            mailbox: commands_tx.downgrade(),
            events_tx,
            generation: None,
            epoch: 0,
            tracker: ReconnectTracker::new(),
            qr_announced: false,
        };
        tokio::spawn(actor.run(commands, events));
        commands_tx
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) {
        debug!("lifecycle actor for {} started", self.key);
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        debug!("lifecycle actor for {} stopped", self.key);
    }

    /// Returns `false` when the actor should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { reset, reply } => {
                let result = self.connect(reset).await;
                let deleted = matches!(result, Err(LifecycleError::DeviceNotFound(_)));
                let _ = reply.send(result);
                if deleted {
                    return false;
                }
            }
            Command::Logout { reply } => {
                let result = self.logout().await;
                let _ = reply.send(result);
            }
            Command::ReconnectDue { epoch } => {
                if epoch != self.epoch {
                    debug!("stale reconnect timer for {} ignored", self.key);
                } else if let Err(e) = self.reconnect_now().await {
                    error!("reconnect of {} failed: {e}", self.key);
                }
            }
            Command::Shutdown { purge, reply } => {
                self.teardown(purge).await;
                self.epoch += 1;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        if self.generation != Some(event.generation) {
            debug!(
                "ignoring event from stale session {} of {}",
                event.generation, self.key
            );
            return;
        }
        let result = match event.event {
            TransportEvent::QrIssued(code) => self.on_pairing_code(&code).await,
            TransportEvent::Opened(account) => self.on_opened(&account).await,
            TransportEvent::Closed { status_code } => self.on_closed(status_code).await,
        };
        if let Err(e) = result {
            error!("lifecycle event for {} failed: {e}", self.key);
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    async fn connect(&mut self, reset: bool) -> Result<ConnectOutcome, LifecycleError> {
        if !self.shared.db.device_exists(&self.key)? {
            info!("device {} was deleted; not connecting", self.key);
            self.teardown(true).await;
            return Err(LifecycleError::DeviceNotFound(self.key.clone()));
        }
        if reset {
            info!("resetting session of {}", self.key);
            self.teardown(true).await;
            self.tracker.reset();
            self.epoch += 1;
        }
        let acquired = self
            .shared
            .registry
            .acquire(&self.key, self.events_tx.clone())
            .await?;
        if acquired.created {
            self.begin_attempt(acquired.generation).await?;
        } else {
            self.generation = Some(acquired.generation);
        }
        Ok(ConnectOutcome {
            created: acquired.created,
            generation: acquired.generation,
        })
    }

    async fn logout(&mut self) -> Result<bool, LifecycleError> {
        let handle = self.shared.registry.get(&self.key);
        let had_session = handle.is_some();
        if let Some(handle) = handle {
            if let Err(e) = handle.logout().await {
                warn!("logout of {} was not acknowledged: {e}", self.key);
            }
        }
        self.teardown(true).await;
        self.tracker.reset();
        self.epoch += 1;

        if had_session {
            let reason = TerminalReason::LoggedOut;
            self.shared
                .bridge
                .apply(
                    &self.key,
                    StatusChange::Disconnected {
                        reason: reason.as_str().to_string(),
                        code: Some(reason.code()),
                    },
                )
                .await?;
        } else {
            self.shared.db.update_device_status(
                &self.key,
                DeviceStatus::Disconnected,
                None,
                Utc::now(),
            )?;
        }
        info!("device {} logged out (live session: {had_session})", self.key);
        Ok(had_session)
    }

    async fn reconnect_now(&mut self) -> Result<(), LifecycleError> {
        if !self.shared.db.device_exists(&self.key)? {
            info!("device {} was deleted; not reconnecting", self.key);
            self.teardown(true).await;
            return Ok(());
        }
        match self
            .shared
            .registry
            .acquire(&self.key, self.events_tx.clone())
            .await
        {
            Ok(acquired) if acquired.created => self.begin_attempt(acquired.generation).await,
            Ok(acquired) => {
                self.generation = Some(acquired.generation);
                Ok(())
            }
            Err(e) => {
                warn!("reconnect of {} could not open a session: {e}", self.key);
                self.schedule_reconnect(CONNECT_FAILED_CODE).await
            }
        }
    }

    // ── Session events ────────────────────────────────────────────────────────

    async fn on_pairing_code(&mut self, code: &str) -> Result<(), LifecycleError> {
        let rendered = render_pairing_code(code)?;
        let announce = !self.qr_announced;
        self.qr_announced = true;
        self.shared
            .bridge
            .apply(&self.key, StatusChange::PairingCode { rendered, announce })
            .await?;
        Ok(())
    }

    async fn on_opened(&mut self, account: &AccountInfo) -> Result<(), LifecycleError> {
        self.tracker.reset();
        self.qr_announced = false;
        let phone_number = account.phone_number().to_string();
        info!("device {} connected as {phone_number}", self.key);
        self.shared
            .bridge
            .apply(&self.key, StatusChange::Connected { phone_number })
            .await?;
        Ok(())
    }

    async fn on_closed(&mut self, status_code: u16) -> Result<(), LifecycleError> {
        match DisconnectReason::classify(status_code) {
            DisconnectReason::Terminal(reason) => {
                warn!("device {} closed terminally: {reason}", self.key);
                self.teardown(true).await;
                self.tracker.reset();
                self.epoch += 1;
                self.shared
                    .bridge
                    .apply(
                        &self.key,
                        StatusChange::Disconnected {
                            reason: reason.as_str().to_string(),
                            code: Some(reason.code()),
                        },
                    )
                    .await?;
                Ok(())
            }
            DisconnectReason::Transient { code } => self.schedule_reconnect(code).await,
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn schedule_reconnect(&mut self, code: u16) -> Result<(), LifecycleError> {
        if !self.shared.db.device_exists(&self.key)? {
            info!("device {} was deleted; cleaning up", self.key);
            self.teardown(true).await;
            return Ok(());
        }

        match self.tracker.on_transient_close(&self.shared.policy) {
            ReconnectDecision::GiveUp { attempts } => {
                warn!(
                    "device {} gave up reconnecting after {attempts} attempts",
                    self.key
                );
                self.teardown(false).await;
                self.epoch += 1;
                self.shared
                    .bridge
                    .apply(
                        &self.key,
                        StatusChange::Disconnected {
                            reason: MAX_RECONNECT_REACHED.to_string(),
                            code: Some(code),
                        },
                    )
                    .await?;
            }
            ReconnectDecision::Retry { attempt, delay } => {
                info!(
                    instance_id = %self.key,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    code,
                    "scheduling reconnect"
                );
                self.shared
                    .bridge
                    .apply(&self.key, StatusChange::Reconnecting { attempt, code })
                    .await?;
                self.teardown(false).await;
                self.epoch += 1;
                self.arm_timer(delay);
            }
        }
        Ok(())
    }

    fn arm_timer(&self, delay: Duration) {
        let epoch = self.epoch;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Command::ReconnectDue { epoch }).await;
            }
        });
    }

    async fn begin_attempt(&mut self, generation: u64) -> Result<(), LifecycleError> {
        self.generation = Some(generation);
        self.qr_announced = false;
        self.epoch += 1;
        self.shared
            .bridge
            .apply(&self.key, StatusChange::Connecting)
            .await?;
        Ok(())
    }

    async fn teardown(&mut self, purge: bool) {
        self.shared.registry.release(&self.key).await;
        self.generation = None;
        self.qr_announced = false;
        if purge {
            if let Err(e) = self.shared.registry.files().purge(&self.key) {
                warn!("could not delete session files of {}: {e}", self.key);
            }
        }
    }
}
