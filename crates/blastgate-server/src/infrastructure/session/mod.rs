//! Session registry: at most one live transport session per device.
//!
//! # How the registry keeps sessions unique (for beginners)
//!
//! Several callers may ask for the same device's session at once: an HTTP
//! login, a reconnect timer firing, a startup restore.  If each opened its
//! own socket the network would see two clients with the same credentials
//! and kick both (`connectionReplaced`).
//!
//! The registry therefore keeps one *slot* per device key, each guarded by
//! its own async mutex:
//!
//! ```text
//!   slots: { "key-a" ─▶ Mutex<Slot { live: Some(session #3) }>,
//!            "key-b" ─▶ Mutex<Slot { live: None }> }
//! ```
//!
//! Every operation on a key locks that key's slot for its whole duration, so
//! a second `acquire` waits for the first one's connect and then reuses the
//! session it created.  Different keys have different mutexes and never
//! wait on each other.
//!
//! Readers never take a slot lock.  Whoever holds a slot publishes its live
//! session into a plain map, and [`SessionRegistry::get`] reads that map, so
//! a lookup never waits behind a connect that may take a minute.
//!
//! Each session gets a *generation* number.  Its events are forwarded by a
//! pump task tagged with that generation; tearing a session down aborts the
//! pump, and anything already in flight carries an old generation the
//! consumer can recognise as stale.

pub mod files;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blastgate_core::DeviceKey;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use files::SessionFiles;

use super::transport::{SessionHandle, Transport, TransportError, TransportEvent};

/// A transport event tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub key: DeviceKey,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Result of [`SessionRegistry::acquire`].
#[derive(Clone)]
pub struct Acquired {
    pub handle: Arc<dyn SessionHandle>,
    pub generation: u64,
    /// `false` when an existing live session was returned.
    pub created: bool,
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquired")
            .field("generation", &self.generation)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

struct LiveSession {
    handle: Arc<dyn SessionHandle>,
    generation: u64,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    live: Option<LiveSession>,
}

type SlotRef = Arc<tokio::sync::Mutex<Slot>>;

pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    files: SessionFiles,
    connect_timeout: Duration,
    slots: Mutex<HashMap<DeviceKey, SlotRef>>,
    /// Snapshot of every live session; written only under the key's slot lock.
    published: Mutex<HashMap<DeviceKey, (Arc<dyn SessionHandle>, u64)>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, files: SessionFiles, connect_timeout: Duration) -> Self {
        Self {
            transport,
            files,
            connect_timeout,
            slots: Mutex::new(HashMap::new()),
            published: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn files(&self) -> &SessionFiles {
        &self.files
    }

    fn slot(&self, key: &DeviceKey) -> SlotRef {
        Arc::clone(self.slots.lock().entry(key.clone()).or_default())
    }

    /// Returns the live session for `key`, opening one if there is none.
    /// Events of a newly opened session are forwarded into `sink`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when a new session cannot be opened.
    pub async fn acquire(
        &self,
        key: &DeviceKey,
        sink: mpsc::Sender<SessionEvent>,
    ) -> Result<Acquired, TransportError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(live) = &guard.live {
            return Ok(Acquired {
                handle: Arc::clone(&live.handle),
                generation: live.generation,
                created: false,
            });
        }
        self.open_into(key, &mut guard, sink).await
    }

    /// Tears down any live session for `key` and opens a new one.
    ///
    /// # Errors
    ///
    /// Returns the transport's error when the new session cannot be opened;
    /// the old one is gone either way.
    pub async fn replace(
        &self,
        key: &DeviceKey,
        sink: mpsc::Sender<SessionEvent>,
    ) -> Result<Acquired, TransportError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(old) = guard.live.take() {
            self.published.lock().remove(key);
            teardown(key, old).await;
        }
        self.open_into(key, &mut guard, sink).await
    }

    /// Tears down the live session for `key`.  Returns whether one existed.
    pub async fn release(&self, key: &DeviceKey) -> bool {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        match guard.live.take() {
            Some(live) => {
                self.published.lock().remove(key);
                teardown(key, live).await;
                true
            }
            None => false,
        }
    }

    /// Drops the slot of a deleted device.  Call after [`release`](Self::release).
    pub fn forget(&self, key: &DeviceKey) {
        self.slots.lock().remove(key);
    }

    /// Live session for `key`.  Does not wait for a connect in progress; a
    /// session still being opened is reported as absent.
    pub fn get(&self, key: &DeviceKey) -> Option<Arc<dyn SessionHandle>> {
        self.published
            .lock()
            .get(key)
            .map(|(handle, _)| Arc::clone(handle))
    }

    /// Generation of the live session for `key`, if any.
    pub fn generation(&self, key: &DeviceKey) -> Option<u64> {
        self.published.lock().get(key).map(|(_, generation)| *generation)
    }

    pub fn live_count(&self) -> usize {
        self.published.lock().len()
    }

    async fn open_into(
        &self,
        key: &DeviceKey,
        slot: &mut Slot,
        sink: mpsc::Sender<SessionEvent>,
    ) -> Result<Acquired, TransportError> {
        let dir = self
            .files
            .prepare(key)
            .map_err(|e| TransportError::SessionStorage(e.to_string()))?;

        let connection =
            match tokio::time::timeout(self.connect_timeout, self.transport.connect(key, &dir))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(TransportError::ConnectTimeout(self.connect_timeout)),
            };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut events = connection.events;
        let pump_key = key.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let tagged = SessionEvent {
                    key: pump_key.clone(),
                    generation,
                    event,
                };
                if sink.send(tagged).await.is_err() {
                    break;
                }
            }
        });

        info!("opened session for {key} (generation {generation})");
        self.published
            .lock()
            .insert(key.clone(), (Arc::clone(&connection.handle), generation));
        slot.live = Some(LiveSession {
            handle: Arc::clone(&connection.handle),
            generation,
            pump,
        });
        Ok(Acquired {
            handle: connection.handle,
            generation,
            created: true,
        })
    }
}

/// Unsubscribes from the session's events, then closes it.
async fn teardown(key: &DeviceKey, live: LiveSession) {
    live.pump.abort();
    live.handle.close().await;
    debug!("closed session for {key} (generation {})", live.generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::mock::MockTransport;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        transport: MockTransport,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(transport.clone()),
            SessionFiles::new(tmp.path()),
            Duration::from_secs(5),
        ));
        Fixture {
            registry,
            transport,
            _tmp: tmp,
        }
    }

    fn key(raw: &str) -> DeviceKey {
        DeviceKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_session() {
        // Arrange
        let fx = fixture();
        let (tx, _rx) = mpsc::channel(8);

        // Act
        let first = fx.registry.acquire(&key("a"), tx.clone()).await.unwrap();
        let second = fx.registry.acquire(&key("a"), tx).await.unwrap();

        // Assert
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.generation, second.generation);
        assert_eq!(fx.transport.connect_count(&key("a")), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_open_one_session() {
        // Arrange
        let fx = fixture();
        let (tx, _rx) = mpsc::channel(8);

        // Act
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&fx.registry);
                let tx = tx.clone();
                tokio::spawn(async move { registry.acquire(&key("a"), tx).await })
            })
            .collect();
        let results = futures_util::future::join_all(tasks).await;

        // Assert
        let created = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|a| a.created)
            .count();
        assert_eq!(created, 1);
        assert_eq!(fx.transport.connect_count(&key("a")), 1);
    }

    #[tokio::test]
    async fn test_replace_closes_old_session_and_bumps_generation() {
        let fx = fixture();
        let (tx, _rx) = mpsc::channel(8);
        let first = fx.registry.acquire(&key("a"), tx.clone()).await.unwrap();
        let old_session = fx.transport.session(&key("a")).unwrap();

        let second = fx.registry.replace(&key("a"), tx).await.unwrap();

        assert!(old_session.is_closed());
        assert!(second.created);
        assert!(second.generation > first.generation);
        assert_eq!(fx.registry.generation(&key("a")), Some(second.generation));
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_generation() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::channel(8);
        let acquired = fx.registry.acquire(&key("a"), tx).await.unwrap();

        fx.transport
            .emit(&key("a"), TransportEvent::QrIssued("code".to_string()))
            .await;

        assert_eq!(
            rx.recv().await,
            Some(SessionEvent {
                key: key("a"),
                generation: acquired.generation,
                event: TransportEvent::QrIssued("code".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_release_stops_forwarding() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::channel(8);
        fx.registry.acquire(&key("a"), tx).await.unwrap();

        assert!(fx.registry.release(&key("a")).await);
        fx.transport
            .emit(&key("a"), TransportEvent::Closed { status_code: 428 })
            .await;

        assert!(fx.registry.get(&key("a")).is_none());
        assert!(!fx.registry.release(&key("a")).await);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let fx = fixture();
        let (tx, _rx) = mpsc::channel(8);
        fx.registry.acquire(&key("a"), tx.clone()).await.unwrap();
        fx.registry.acquire(&key("b"), tx).await.unwrap();

        fx.registry.release(&key("a")).await;

        assert!(fx.registry.get(&key("b")).is_some());
        assert_eq!(fx.registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_slot_empty() {
        let fx = fixture();
        let (tx, _rx) = mpsc::channel(8);
        fx.transport.fail_next_connects(1);

        let result = fx.registry.acquire(&key("a"), tx).await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(fx.registry.get(&key("a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_does_not_wait_for_connect_in_progress() {
        // Arrange: a live session whose replacement takes 4 s to connect
        let fx = fixture();
        let (tx, _rx) = mpsc::channel(8);
        fx.registry.acquire(&key("a"), tx.clone()).await.unwrap();
        fx.transport.set_connect_delay(Duration::from_secs(4));
        let registry = Arc::clone(&fx.registry);
        let replacing = tokio::spawn(async move { registry.replace(&key("a"), tx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Act
        let during = fx.registry.get(&key("a"));
        let replaced = replacing.await.unwrap().unwrap();

        // Assert: the old session is gone and the new one is not published yet
        assert!(during.is_none());
        assert_eq!(fx.registry.live_count(), 1);
        assert_eq!(fx.registry.generation(&key("a")), Some(replaced.generation));
    }
}
