//! SQLite persistence for devices, blasts and recipients.
//!
//! One connection guarded by a `parking_lot::Mutex`.  Every method takes the
//! lock for the duration of one statement or transaction and never across an
//! `.await`, so callers in async code simply call it inline.
//!
//! Timestamps are stored as Unix milliseconds so `scheduled_at <= now`
//! compares numerically.
//!
//! # Counter updates
//!
//! [`Database::record_outcome`] is the only writer of `sent_count` /
//! `failed_count` during delivery.  Inside a single transaction it:
//!
//! 1. moves the recipient out of `pending` (a recipient that already has an
//!    outcome is left alone and nothing else happens),
//! 2. increments exactly one counter,
//! 3. re-reads the counters and, if the blast is still `processing` and every
//!    recipient has an outcome, writes the terminal status.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use blastgate_core::{
    Blast, BlastCounters, BlastId, BlastStatus, DeliveryOutcome, Device, DeviceKey, DeviceStatus,
    NewBlast, Recipient, RecipientId, RecipientStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS devices (
    instance_key      TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'disconnected',
    phone_number      TEXT,
    qr_code           TEXT,
    last_connected_at INTEGER,
    created_at        INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blasts (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    device_key       TEXT NOT NULL REFERENCES devices(instance_key) ON DELETE CASCADE,
    name             TEXT NOT NULL,
    message          TEXT NOT NULL,
    media_url        TEXT,
    delay_min_secs   INTEGER NOT NULL,
    delay_max_secs   INTEGER NOT NULL,
    scheduled_at     INTEGER NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    total_recipients INTEGER NOT NULL,
    sent_count       INTEGER NOT NULL DEFAULT 0,
    failed_count     INTEGER NOT NULL DEFAULT 0,
    created_at       INTEGER NOT NULL,
    CHECK (sent_count + failed_count <= total_recipients)
);

CREATE INDEX IF NOT EXISTS idx_blasts_due ON blasts(status, scheduled_at);

CREATE TABLE IF NOT EXISTS recipients (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    blast_id      INTEGER NOT NULL REFERENCES blasts(id) ON DELETE CASCADE,
    phone_number  TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending',
    sent_at       INTEGER,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_recipients_blast ON recipients(blast_id, status);
";

const DEVICE_COLUMNS: &str =
    "instance_key, name, status, phone_number, qr_code, last_connected_at, created_at";
const BLAST_COLUMNS: &str = "id, device_key, name, message, media_url, delay_min_secs, \
     delay_max_secs, scheduled_at, status, total_recipients, sent_count, failed_count, created_at";
const RECIPIENT_COLUMNS: &str = "id, blast_id, phone_number, status, sent_at, error_message";

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("could not prepare database location {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device {0} not found")]
    DeviceNotFound(DeviceKey),
}

/// Result of recording one recipient outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedOutcome {
    pub blast_id: BlastId,
    pub counters: BlastCounters,
    /// Set when this outcome moved the blast into its terminal status.
    pub finished: Option<BlastStatus>,
}

/// Result of resetting a blast's failed recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    BlastNotFound,
    /// Only settled blasts can be retried.
    Busy(BlastStatus),
    NothingToRetry,
    Reset(Vec<Recipient>),
}

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (creating if needed) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the parent directory cannot be created
    /// and [`StoreError::Sqlite`] when the file cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    /// Creates a device with a freshly generated key.
    pub fn create_device(&self, name: &str) -> Result<Device, StoreError> {
        self.insert_device(&DeviceKey::generate(), name)
    }

    pub fn insert_device(&self, key: &DeviceKey, name: &str) -> Result<Device, StoreError> {
        let now = Utc::now();
        self.conn.lock().execute(
            "INSERT INTO devices (instance_key, name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![key.as_str(), name, DeviceStatus::Disconnected.as_str(), millis(now)],
        )?;
        Ok(Device {
            key: key.clone(),
            name: name.to_string(),
            status: DeviceStatus::Disconnected,
            phone_number: None,
            qr_code: None,
            last_connected_at: None,
            created_at: from_millis_lossy(millis(now)),
        })
    }

    pub fn device(&self, key: &DeviceKey) -> Result<Option<Device>, StoreError> {
        let device = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE instance_key = ?1"),
                params![key.as_str()],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    pub fn device_exists(&self, key: &DeviceKey) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT 1 FROM devices WHERE instance_key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn devices(&self) -> Result<Vec<Device>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY created_at, instance_key"
        ))?;
        let rows = stmt
            .query_map([], device_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes a device together with its blasts and recipients.
    pub fn delete_device(&self, key: &DeviceKey) -> Result<bool, StoreError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM devices WHERE instance_key = ?1",
            params![key.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Writes a connection status change.
    ///
    /// `Connected` also binds `phone_number` (when given), stamps
    /// `last_connected_at`.  Every status change clears the pairing code;
    /// a new connection attempt issues new codes.  Returns `false` for an
    /// unknown device.
    pub fn update_device_status(
        &self,
        key: &DeviceKey,
        status: DeviceStatus,
        phone_number: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = match status {
            DeviceStatus::Connected => conn.execute(
                "UPDATE devices
                    SET status = ?2,
                        phone_number = COALESCE(?3, phone_number),
                        last_connected_at = ?4,
                        qr_code = NULL
                  WHERE instance_key = ?1",
                params![key.as_str(), status.as_str(), phone_number, millis(now)],
            )?,
            DeviceStatus::Disconnected | DeviceStatus::Connecting => conn.execute(
                "UPDATE devices SET status = ?2, qr_code = NULL WHERE instance_key = ?1",
                params![key.as_str(), status.as_str()],
            )?,
        };
        Ok(changed > 0)
    }

    /// Stores a rendered pairing code and marks the device connecting.
    pub fn save_pairing_code(&self, key: &DeviceKey, qr_code: &str) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE devices SET status = ?2, qr_code = ?3 WHERE instance_key = ?1",
            params![key.as_str(), DeviceStatus::Connecting.as_str(), qr_code],
        )?;
        Ok(changed > 0)
    }

    // ── Blasts ────────────────────────────────────────────────────────────────

    /// Inserts a blast and its recipient set in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DeviceNotFound`] when the device does not exist.
    pub fn create_blast(&self, new: &NewBlast) -> Result<Blast, StoreError> {
        let now = Utc::now();
        let total = u32::try_from(new.recipients.len()).unwrap_or(u32::MAX);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let device_known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM devices WHERE instance_key = ?1",
                params![new.device_key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if device_known.is_none() {
            return Err(StoreError::DeviceNotFound(new.device_key.clone()));
        }

        tx.execute(
            "INSERT INTO blasts (device_key, name, message, media_url, delay_min_secs,
                                 delay_max_secs, scheduled_at, status, total_recipients, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                new.device_key.as_str(),
                new.name,
                new.message,
                new.media_url,
                new.delay_min_secs,
                new.delay_max_secs,
                millis(new.scheduled_at),
                BlastStatus::Pending.as_str(),
                total,
                millis(now),
            ],
        )?;
        let blast_id = tx.last_insert_rowid();
        {
            let mut insert = tx.prepare(
                "INSERT INTO recipients (blast_id, phone_number, status) VALUES (?1, ?2, ?3)",
            )?;
            for phone in &new.recipients {
                insert.execute(params![blast_id, phone, RecipientStatus::Pending.as_str()])?;
            }
        }
        let blast = tx.query_row(
            &format!("SELECT {BLAST_COLUMNS} FROM blasts WHERE id = ?1"),
            params![blast_id],
            blast_from_row,
        )?;
        tx.commit()?;
        debug!("created blast {blast_id} with {total} recipients");
        Ok(blast)
    }

    pub fn blast(&self, id: BlastId) -> Result<Option<Blast>, StoreError> {
        let blast = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {BLAST_COLUMNS} FROM blasts WHERE id = ?1"),
                params![id],
                blast_from_row,
            )
            .optional()?;
        Ok(blast)
    }

    pub fn delete_blast(&self, id: BlastId) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM blasts WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Pending blasts whose scheduled time has come, oldest first.
    pub fn due_blasts(&self, now: DateTime<Utc>) -> Result<Vec<Blast>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BLAST_COLUMNS} FROM blasts
              WHERE status = ?1 AND scheduled_at <= ?2
              ORDER BY scheduled_at, id"
        ))?;
        let rows = stmt
            .query_map(
                params![BlastStatus::Pending.as_str(), millis(now)],
                blast_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Moves a blast from `pending` to `processing`.  Returns `false` if the
    /// blast is missing or not pending, so a blast is claimed only once.
    pub fn begin_processing(&self, id: BlastId) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE blasts SET status = ?2 WHERE id = ?1 AND status = ?3",
            params![
                id,
                BlastStatus::Processing.as_str(),
                BlastStatus::Pending.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Hands a claim back: `processing` → `pending`.  Returns `false` if the
    /// blast is missing or no longer processing.
    pub fn release_processing(&self, id: BlastId) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE blasts SET status = ?2 WHERE id = ?1 AND status = ?3",
            params![
                id,
                BlastStatus::Pending.as_str(),
                BlastStatus::Processing.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Runs a raw statement; lets tests put rows into states the API never
    /// produces.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize, StoreError> {
        Ok(self.conn.lock().execute(sql, [])?)
    }

    /// Writes the terminal status of a `processing` blast whose counters are
    /// already settled (e.g. one without pending recipients).
    pub fn finish_if_settled(&self, id: BlastId) -> Result<Option<BlastStatus>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let finished = settle_in_tx(&tx, id)?.1;
        tx.commit()?;
        Ok(finished)
    }

    // ── Recipients ────────────────────────────────────────────────────────────

    /// All recipients of a blast in creation order.
    pub fn recipients(&self, blast_id: BlastId) -> Result<Vec<Recipient>, StoreError> {
        self.query_recipients(
            &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE blast_id = ?1 ORDER BY id"),
            params![blast_id],
        )
    }

    pub fn pending_recipients(&self, blast_id: BlastId) -> Result<Vec<Recipient>, StoreError> {
        self.query_recipients(
            &format!(
                "SELECT {RECIPIENT_COLUMNS} FROM recipients
                  WHERE blast_id = ?1 AND status = ?2 ORDER BY id"
            ),
            params![blast_id, RecipientStatus::Pending.as_str()],
        )
    }

    pub fn recipient(&self, id: RecipientId) -> Result<Option<Recipient>, StoreError> {
        let recipient = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE id = ?1"),
                params![id],
                recipient_from_row,
            )
            .optional()?;
        Ok(recipient)
    }

    fn query_recipients(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Recipient>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, recipient_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Records the final outcome for a pending recipient.
    ///
    /// Returns `None` when the recipient no longer exists or already has an
    /// outcome; nothing is changed in that case.
    pub fn record_outcome(
        &self,
        recipient_id: RecipientId,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<RecordedOutcome>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let blast_id: Option<BlastId> = tx
            .query_row(
                "SELECT blast_id FROM recipients WHERE id = ?1 AND status = ?2",
                params![recipient_id, RecipientStatus::Pending.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(blast_id) = blast_id else {
            return Ok(None);
        };

        match outcome {
            DeliveryOutcome::Sent => {
                tx.execute(
                    "UPDATE recipients SET status = ?2, sent_at = ?3, error_message = NULL
                      WHERE id = ?1",
                    params![recipient_id, RecipientStatus::Sent.as_str(), millis(now)],
                )?;
                tx.execute(
                    "UPDATE blasts SET sent_count = sent_count + 1 WHERE id = ?1",
                    params![blast_id],
                )?;
            }
            DeliveryOutcome::Failed { reason } => {
                tx.execute(
                    "UPDATE recipients SET status = ?2, error_message = ?3 WHERE id = ?1",
                    params![recipient_id, RecipientStatus::Failed.as_str(), reason],
                )?;
                tx.execute(
                    "UPDATE blasts SET failed_count = failed_count + 1 WHERE id = ?1",
                    params![blast_id],
                )?;
            }
        }

        let (counters, finished) = settle_in_tx(&tx, blast_id)?;
        tx.commit()?;
        Ok(Some(RecordedOutcome {
            blast_id,
            counters,
            finished,
        }))
    }

    /// Resets every failed recipient of a settled blast to `pending` and puts
    /// the blast back into `processing` with `failed_count = 0`.
    pub fn reset_failed(&self, blast_id: BlastId) -> Result<ResetOutcome, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM blasts WHERE id = ?1",
                params![blast_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status else {
            return Ok(ResetOutcome::BlastNotFound);
        };
        let status = parse_status::<BlastStatus>(0, &status)?;
        if !status.is_terminal() {
            return Ok(ResetOutcome::Busy(status));
        }

        let failed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {RECIPIENT_COLUMNS} FROM recipients
                  WHERE blast_id = ?1 AND status = ?2 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(
                    params![blast_id, RecipientStatus::Failed.as_str()],
                    recipient_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        if failed.is_empty() {
            return Ok(ResetOutcome::NothingToRetry);
        }

        tx.execute(
            "UPDATE recipients SET status = ?2, error_message = NULL, sent_at = NULL
              WHERE blast_id = ?1 AND status = ?3",
            params![
                blast_id,
                RecipientStatus::Pending.as_str(),
                RecipientStatus::Failed.as_str()
            ],
        )?;
        tx.execute(
            "UPDATE blasts SET status = ?2, failed_count = 0 WHERE id = ?1",
            params![blast_id, BlastStatus::Processing.as_str()],
        )?;
        tx.commit()?;

        Ok(ResetOutcome::Reset(
            failed
                .into_iter()
                .map(|r| Recipient {
                    status: RecipientStatus::Pending,
                    error_message: None,
                    sent_at: None,
                    ..r
                })
                .collect(),
        ))
    }
}

// ── Row helpers ───────────────────────────────────────────────────────────────

/// Re-reads the counters of `blast_id` and writes the terminal status when a
/// `processing` blast has settled.
fn settle_in_tx(
    tx: &rusqlite::Transaction<'_>,
    blast_id: BlastId,
) -> Result<(BlastCounters, Option<BlastStatus>), StoreError> {
    let (status, counters) = tx.query_row(
        "SELECT status, total_recipients, sent_count, failed_count FROM blasts WHERE id = ?1",
        params![blast_id],
        |row| {
            let status: String = row.get(0)?;
            Ok((
                parse_status::<BlastStatus>(0, &status)?,
                BlastCounters {
                    total: row.get(1)?,
                    sent: row.get(2)?,
                    failed: row.get(3)?,
                },
            ))
        },
    )?;

    if status != BlastStatus::Processing || !counters.is_settled() {
        return Ok((counters, None));
    }
    let terminal = counters.terminal_status();
    let changed = tx.execute(
        "UPDATE blasts SET status = ?2 WHERE id = ?1 AND status = ?3",
        params![
            blast_id,
            terminal.as_str(),
            BlastStatus::Processing.as_str()
        ],
    )?;
    Ok((counters, (changed > 0).then_some(terminal)))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn from_millis_lossy(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn optional_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_millis(idx, ms))
        .transpose()
}

fn parse_status<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_key(idx: usize, raw: &str) -> rusqlite::Result<DeviceKey> {
    DeviceKey::parse(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let key: String = row.get(0)?;
    let status: String = row.get(2)?;
    Ok(Device {
        key: parse_key(0, &key)?,
        name: row.get(1)?,
        status: parse_status::<DeviceStatus>(2, &status)?,
        phone_number: row.get(3)?,
        qr_code: row.get(4)?,
        last_connected_at: optional_millis(row, 5)?,
        created_at: from_millis(6, row.get(6)?)?,
    })
}

fn blast_from_row(row: &Row<'_>) -> rusqlite::Result<Blast> {
    let device_key: String = row.get(1)?;
    let status: String = row.get(8)?;
    Ok(Blast {
        id: row.get(0)?,
        device_key: parse_key(1, &device_key)?,
        name: row.get(2)?,
        message: row.get(3)?,
        media_url: row.get(4)?,
        delay_min_secs: row.get(5)?,
        delay_max_secs: row.get(6)?,
        scheduled_at: from_millis(7, row.get(7)?)?,
        status: parse_status::<BlastStatus>(8, &status)?,
        counters: BlastCounters {
            total: row.get(9)?,
            sent: row.get(10)?,
            failed: row.get(11)?,
        },
        created_at: from_millis(12, row.get(12)?)?,
    })
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    let status: String = row.get(3)?;
    Ok(Recipient {
        id: row.get(0)?,
        blast_id: row.get(1)?,
        phone_number: row.get(2)?,
        status: parse_status::<RecipientStatus>(3, &status)?,
        sent_at: optional_millis(row, 4)?,
        error_message: row.get(5)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn db_with_device() -> (Database, DeviceKey) {
        let db = Database::in_memory().unwrap();
        let device = db.create_device("Sales").unwrap();
        (db, device.key)
    }

    fn new_blast(key: &DeviceKey, recipients: &[&str]) -> NewBlast {
        NewBlast {
            device_key: key.clone(),
            name: "Promo".to_string(),
            message: "Hello".to_string(),
            media_url: None,
            delay_min_secs: 0,
            delay_max_secs: 0,
            scheduled_at: Utc::now(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
        }
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    #[test]
    fn test_create_device_starts_disconnected() {
        // Arrange / Act
        let (db, key) = db_with_device();
        let device = db.device(&key).unwrap().unwrap();

        // Assert
        assert_eq!(device.status, DeviceStatus::Disconnected);
        assert_eq!(device.name, "Sales");
        assert!(device.phone_number.is_none());
        assert!(db.device_exists(&key).unwrap());
    }

    #[test]
    fn test_pairing_code_then_connected_clears_code_and_binds_phone() {
        // Arrange
        let (db, key) = db_with_device();
        let now = Utc::now();

        // Act
        db.save_pairing_code(&key, "data:image/svg+xml;base64,AAA").unwrap();
        let pairing = db.device(&key).unwrap().unwrap();
        db.update_device_status(&key, DeviceStatus::Connected, Some("62812"), now)
            .unwrap();
        let connected = db.device(&key).unwrap().unwrap();

        // Assert
        assert_eq!(pairing.status, DeviceStatus::Connecting);
        assert!(pairing.qr_code.is_some());
        assert_eq!(connected.status, DeviceStatus::Connected);
        assert_eq!(connected.qr_code, None);
        assert_eq!(connected.phone_number.as_deref(), Some("62812"));
        assert_eq!(
            connected.last_connected_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }

    #[test]
    fn test_disconnect_clears_code_but_keeps_phone() {
        let (db, key) = db_with_device();
        db.update_device_status(&key, DeviceStatus::Connected, Some("62812"), Utc::now())
            .unwrap();
        db.save_pairing_code(&key, "qr").unwrap();

        db.update_device_status(&key, DeviceStatus::Disconnected, None, Utc::now())
            .unwrap();

        let device = db.device(&key).unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Disconnected);
        assert_eq!(device.qr_code, None);
        assert_eq!(device.phone_number.as_deref(), Some("62812"));
    }

    #[test]
    fn test_status_update_for_unknown_device_reports_false() {
        let db = Database::in_memory().unwrap();
        let ghost = DeviceKey::generate();
        assert!(!db
            .update_device_status(&ghost, DeviceStatus::Connecting, None, Utc::now())
            .unwrap());
    }

    #[test]
    fn test_delete_device_cascades_to_blasts() {
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1", "2"])).unwrap();

        assert!(db.delete_device(&key).unwrap());

        assert!(db.blast(blast.id).unwrap().is_none());
        assert!(db.recipients(blast.id).unwrap().is_empty());
    }

    // ── Blasts ────────────────────────────────────────────────────────────────

    #[test]
    fn test_create_blast_for_unknown_device_fails() {
        let db = Database::in_memory().unwrap();
        let result = db.create_blast(&new_blast(&DeviceKey::generate(), &["1"]));
        assert!(matches!(result, Err(StoreError::DeviceNotFound(_))));
    }

    #[test]
    fn test_create_blast_records_total_and_pending_recipients() {
        let (db, key) = db_with_device();

        let blast = db.create_blast(&new_blast(&key, &["1", "2", "3"])).unwrap();

        assert_eq!(blast.status, BlastStatus::Pending);
        assert_eq!(blast.counters.total, 3);
        assert_eq!(db.pending_recipients(blast.id).unwrap().len(), 3);
    }

    #[test]
    fn test_due_blasts_only_returns_pending_past_schedule() {
        // Arrange
        let (db, key) = db_with_device();
        let now = Utc::now();
        let mut past = new_blast(&key, &["1"]);
        past.scheduled_at = now - Duration::minutes(5);
        let mut future = new_blast(&key, &["1"]);
        future.scheduled_at = now + Duration::minutes(5);
        let past = db.create_blast(&past).unwrap();
        db.create_blast(&future).unwrap();
        let claimed = db.create_blast(&new_blast(&key, &["1"])).unwrap();
        db.begin_processing(claimed.id).unwrap();

        // Act
        let due = db.due_blasts(now).unwrap();

        // Assert
        assert_eq!(due.iter().map(|b| b.id).collect::<Vec<_>>(), vec![past.id]);
    }

    #[test]
    fn test_begin_processing_claims_once() {
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1"])).unwrap();

        assert!(db.begin_processing(blast.id).unwrap());
        assert!(!db.begin_processing(blast.id).unwrap());
    }

    #[test]
    fn test_release_processing_returns_claim() {
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1"])).unwrap();
        assert!(!db.release_processing(blast.id).unwrap());
        db.begin_processing(blast.id).unwrap();

        assert!(db.release_processing(blast.id).unwrap());

        assert_eq!(db.blast(blast.id).unwrap().unwrap().status, BlastStatus::Pending);
        assert!(db.begin_processing(blast.id).unwrap());
    }

    #[test]
    fn test_empty_blast_finishes_completed() {
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &[])).unwrap();
        db.begin_processing(blast.id).unwrap();

        let finished = db.finish_if_settled(blast.id).unwrap();

        assert_eq!(finished, Some(BlastStatus::Completed));
    }

    // ── Outcomes ──────────────────────────────────────────────────────────────

    #[test]
    fn test_outcomes_settle_blast_exactly_once() {
        // Arrange
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1", "2"])).unwrap();
        db.begin_processing(blast.id).unwrap();
        let recipients = db.recipients(blast.id).unwrap();

        // Act
        let first = db
            .record_outcome(recipients[0].id, &DeliveryOutcome::Sent, Utc::now())
            .unwrap()
            .unwrap();
        let second = db
            .record_outcome(recipients[1].id, &DeliveryOutcome::failed("boom"), Utc::now())
            .unwrap()
            .unwrap();

        // Assert
        assert_eq!(first.finished, None);
        assert_eq!(second.finished, Some(BlastStatus::Completed));
        assert_eq!(
            second.counters,
            BlastCounters {
                total: 2,
                sent: 1,
                failed: 1
            }
        );
        let failed = db.recipient(recipients[1].id).unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(db.recipient(recipients[0].id).unwrap().unwrap().sent_at.is_some());
    }

    #[test]
    fn test_second_outcome_for_same_recipient_is_ignored() {
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1", "2"])).unwrap();
        db.begin_processing(blast.id).unwrap();
        let id = db.recipients(blast.id).unwrap()[0].id;

        db.record_outcome(id, &DeliveryOutcome::Sent, Utc::now()).unwrap();
        let again = db
            .record_outcome(id, &DeliveryOutcome::failed("late"), Utc::now())
            .unwrap();

        assert_eq!(again, None);
        let counters = db.blast(blast.id).unwrap().unwrap().counters;
        assert_eq!((counters.sent, counters.failed), (1, 0));
    }

    #[test]
    fn test_all_failed_settles_failed() {
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1", "2"])).unwrap();
        db.begin_processing(blast.id).unwrap();

        let mut last = None;
        for r in db.recipients(blast.id).unwrap() {
            last = db
                .record_outcome(r.id, &DeliveryOutcome::failed("x"), Utc::now())
                .unwrap();
        }

        assert_eq!(last.and_then(|o| o.finished), Some(BlastStatus::Failed));
    }

    #[test]
    fn test_reset_failed_rules() {
        // Arrange
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1", "2", "3"])).unwrap();

        // Act / Assert: pending blast is busy
        assert_eq!(
            db.reset_failed(blast.id).unwrap(),
            ResetOutcome::Busy(BlastStatus::Pending)
        );

        db.begin_processing(blast.id).unwrap();
        let rs = db.recipients(blast.id).unwrap();
        db.record_outcome(rs[0].id, &DeliveryOutcome::Sent, Utc::now()).unwrap();
        db.record_outcome(rs[1].id, &DeliveryOutcome::failed("a"), Utc::now()).unwrap();
        db.record_outcome(rs[2].id, &DeliveryOutcome::failed("b"), Utc::now()).unwrap();

        let reset = match db.reset_failed(blast.id).unwrap() {
            ResetOutcome::Reset(list) => list,
            other => panic!("expected reset, got {other:?}"),
        };
        assert_eq!(reset.len(), 2);
        assert!(reset.iter().all(|r| r.status == RecipientStatus::Pending
            && r.error_message.is_none()));

        let after = db.blast(blast.id).unwrap().unwrap();
        assert_eq!(after.status, BlastStatus::Processing);
        assert_eq!((after.counters.sent, after.counters.failed), (1, 0));
        assert_eq!(db.recipient(rs[0].id).unwrap().unwrap().status, RecipientStatus::Sent);
        assert_eq!(
            db.reset_failed(blast.id).unwrap(),
            ResetOutcome::Busy(BlastStatus::Processing)
        );
    }

    #[test]
    fn test_reset_failed_without_failures() {
        let (db, key) = db_with_device();
        let blast = db.create_blast(&new_blast(&key, &["1"])).unwrap();
        db.begin_processing(blast.id).unwrap();
        let id = db.recipients(blast.id).unwrap()[0].id;
        db.record_outcome(id, &DeliveryOutcome::Sent, Utc::now()).unwrap();

        assert_eq!(db.reset_failed(blast.id).unwrap(), ResetOutcome::NothingToRetry);
        assert_eq!(db.reset_failed(9999).unwrap(), ResetOutcome::BlastNotFound);
    }
}
