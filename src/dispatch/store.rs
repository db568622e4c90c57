use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{Carrier, CarrierId, CheckpointId, CheckpointQueue};
use crate::errors::{ConveyorError, Result};

const DWELL_TIME_KEY: &str = "dwell_time_secs";
const DEFAULT_DWELL_TIME_SECS: f64 = 20.0;

/// Async-safe handle to the carrier store.
///
/// Wraps `CarrierStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads. The mutex makes the store single-writer.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<CarrierStore>>,
}

impl StoreHandle {
    pub fn new(store: CarrierStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CarrierStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| ConveyorError::InvalidState(format!("store lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store mutex synchronously. Only for startup and CLI
    /// commands that run outside the dispatcher.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CarrierStore>> {
        self.inner
            .lock()
            .map_err(|e| ConveyorError::InvalidState(format!("store lock poisoned: {}", e)))
    }
}

/// Durable record keeper for carriers and checkpoint queues.
///
/// Invariants between carriers and queues are enforced by the dispatcher,
/// not here. Every mutating call commits its own transaction.
pub struct CarrierStore {
    conn: Connection,
}

impl CarrierStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open carrier store at {}", path.display()))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing and simulation).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory carrier store")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY,
                ring_position INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS carriers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                checkpoint_id INTEGER REFERENCES checkpoints(id),
                available INTEGER NOT NULL DEFAULT 1,
                in_transit INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS queue_entries (
                carrier_id INTEGER PRIMARY KEY REFERENCES carriers(id) ON DELETE CASCADE,
                checkpoint_id INTEGER NOT NULL REFERENCES checkpoints(id),
                position INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_checkpoint
                ON queue_entries(checkpoint_id, position);

            CREATE TABLE IF NOT EXISTS params (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    /// Record the ring's checkpoints in ring order.
    ///
    /// Checkpoints that dropped out of the ring are forgotten, unless a
    /// carrier still references one of them.
    pub fn register_checkpoints(&self, ring: &[CheckpointId]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let mut referenced = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT checkpoint_id FROM carriers WHERE checkpoint_id IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, CheckpointId>(0))?;
            for row in rows {
                referenced.push(row?);
            }
        }
        if let Some(stale) = referenced.iter().find(|id| !ring.contains(id)) {
            return Err(ConveyorError::InvalidState(format!(
                "checkpoint {} still holds carriers but is not part of the ring {:?}",
                stale, ring
            )));
        }

        let mut known = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT id FROM checkpoints")?;
            let rows = stmt.query_map([], |row| row.get::<_, CheckpointId>(0))?;
            for row in rows {
                known.push(row?);
            }
        }
        for stale in known.iter().filter(|id| !ring.contains(id)) {
            tx.execute("DELETE FROM checkpoints WHERE id = ?1", params![stale])?;
        }
        for (position, id) in ring.iter().enumerate() {
            tx.execute(
                "INSERT INTO checkpoints (id, ring_position) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET ring_position = excluded.ring_position",
                params![id, position as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn checkpoint_ids(&self) -> Result<Vec<CheckpointId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM checkpoints ORDER BY ring_position")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ── Carrier CRUD ──────────────────────────────────────────────────

    /// Create a carrier resident at the tail of `checkpoint`'s queue.
    pub fn create_carrier(&self, checkpoint: CheckpointId) -> Result<Carrier> {
        ensure_checkpoint(&self.conn, checkpoint)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO carriers (checkpoint_id, available, in_transit) VALUES (?1, 1, 0)",
            params![checkpoint],
        )?;
        let id = tx.last_insert_rowid();
        push_queue_entry(&tx, id, checkpoint)?;
        tx.commit()?;
        self.carrier(id)
    }

    /// Remove a carrier record together with any queue residency it has.
    pub fn delete_carrier(&self, id: CarrierId) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM queue_entries WHERE carrier_id = ?1", params![id])?;
        let count = tx.execute("DELETE FROM carriers WHERE id = ?1", params![id])?;
        if count == 0 {
            return Err(ConveyorError::UnknownCarrier { id });
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_carrier(&self, id: CarrierId) -> Result<Option<Carrier>> {
        let carrier = self
            .conn
            .query_row(
                "SELECT id, checkpoint_id, available, in_transit, created_at, updated_at
                 FROM carriers WHERE id = ?1",
                params![id],
                row_to_carrier,
            )
            .optional()?;
        Ok(carrier)
    }

    pub fn carrier(&self, id: CarrierId) -> Result<Carrier> {
        self.get_carrier(id)?
            .ok_or(ConveyorError::UnknownCarrier { id })
    }

    pub fn list_carriers(&self) -> Result<Vec<Carrier>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, checkpoint_id, available, in_transit, created_at, updated_at
             FROM carriers ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_carrier)?;
        let mut carriers = Vec::new();
        for row in rows {
            carriers.push(row?);
        }
        Ok(carriers)
    }

    pub fn checkpoint_of(&self, id: CarrierId) -> Result<Option<CheckpointId>> {
        Ok(self.carrier(id)?.checkpoint)
    }

    // ── Queues ────────────────────────────────────────────────────────

    /// Snapshot of a checkpoint's queue, head first.
    pub fn queue_at(&self, checkpoint: CheckpointId) -> Result<Vec<CarrierId>> {
        ensure_checkpoint(&self.conn, checkpoint)?;
        let mut stmt = self.conn.prepare(
            "SELECT carrier_id FROM queue_entries WHERE checkpoint_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![checkpoint], |row| row.get(0))?;
        let mut carriers = Vec::new();
        for row in rows {
            carriers.push(row?);
        }
        Ok(carriers)
    }

    /// Every checkpoint queue in ring order.
    pub fn list_queues(&self) -> Result<Vec<CheckpointQueue>> {
        let mut queues = Vec::new();
        for checkpoint in self.checkpoint_ids()? {
            queues.push(CheckpointQueue {
                checkpoint,
                carriers: self.queue_at(checkpoint)?,
            });
        }
        Ok(queues)
    }

    pub fn set_available(&self, id: CarrierId, available: bool) -> Result<()> {
        update_availability(&self.conn, id, available)
    }

    pub fn remove_from_queue(&self, id: CarrierId) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        detach_from_queue(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn append_to_queue(&self, id: CarrierId, checkpoint: CheckpointId) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        attach_to_queue(&tx, id, checkpoint)?;
        tx.commit()?;
        Ok(())
    }

    /// Take a carrier off its queue and flag it in transit, atomically.
    pub fn mark_in_transit(&self, id: CarrierId) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        detach_from_queue(&tx, id)?;
        update_availability(&tx, id, false)?;
        tx.commit()?;
        Ok(())
    }

    /// Append a carrier to `checkpoint`'s queue and flag it available, atomically.
    pub fn mark_arrived(&self, id: CarrierId, checkpoint: CheckpointId) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        attach_to_queue(&tx, id, checkpoint)?;
        update_availability(&tx, id, true)?;
        tx.commit()?;
        Ok(())
    }

    // ── Parameters ────────────────────────────────────────────────────

    /// Time a downstream storage actor needs to lift a carrier off the line.
    pub fn dwell_time(&self) -> Result<Duration> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM params WHERE key = ?1",
                params![DWELL_TIME_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let secs = match value {
            Some(raw) => raw.parse::<f64>().map_err(|e| {
                ConveyorError::InvalidState(format!("stored dwell time '{}' is invalid: {}", raw, e))
            })?,
            None => DEFAULT_DWELL_TIME_SECS,
        };
        Duration::try_from_secs_f64(secs).map_err(|e| {
            ConveyorError::InvalidState(format!("stored dwell time {} is invalid: {}", secs, e))
        })
    }

    pub fn set_dwell_time(&self, dwell: Duration) -> Result<()> {
        self.conn.execute(
            "INSERT INTO params (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![DWELL_TIME_KEY, dwell.as_secs_f64().to_string()],
        )?;
        Ok(())
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

fn row_to_carrier(row: &rusqlite::Row<'_>) -> rusqlite::Result<Carrier> {
    Ok(Carrier {
        id: row.get(0)?,
        checkpoint: row.get(1)?,
        available: row.get(2)?,
        in_transit: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn ensure_checkpoint(conn: &Connection, checkpoint: CheckpointId) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM checkpoints WHERE id = ?1",
        params![checkpoint],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(ConveyorError::UnknownCheckpoint { id: checkpoint });
    }
    Ok(())
}

fn push_queue_entry(conn: &Connection, id: CarrierId, checkpoint: CheckpointId) -> Result<()> {
    let position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM queue_entries WHERE checkpoint_id = ?1",
        params![checkpoint],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO queue_entries (carrier_id, checkpoint_id, position) VALUES (?1, ?2, ?3)",
        params![id, checkpoint, position],
    )?;
    Ok(())
}

fn detach_from_queue(conn: &Connection, id: CarrierId) -> Result<()> {
    let removed = conn.execute("DELETE FROM queue_entries WHERE carrier_id = ?1", params![id])?;
    let updated = conn.execute(
        "UPDATE carriers SET checkpoint_id = NULL, updated_at = datetime('now') WHERE id = ?1",
        params![id],
    )?;
    if updated == 0 {
        return Err(ConveyorError::UnknownCarrier { id });
    }
    if removed == 0 {
        return Err(ConveyorError::InvalidState(format!(
            "carrier {} is not resident on any checkpoint",
            id
        )));
    }
    Ok(())
}

fn attach_to_queue(conn: &Connection, id: CarrierId, checkpoint: CheckpointId) -> Result<()> {
    ensure_checkpoint(conn, checkpoint)?;
    let resident: Option<CheckpointId> = conn
        .query_row(
            "SELECT checkpoint_id FROM queue_entries WHERE carrier_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(current) = resident {
        return Err(ConveyorError::InvalidState(format!(
            "carrier {} is already resident on checkpoint {}",
            id, current
        )));
    }
    let updated = conn.execute(
        "UPDATE carriers SET checkpoint_id = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![checkpoint, id],
    )?;
    if updated == 0 {
        return Err(ConveyorError::UnknownCarrier { id });
    }
    push_queue_entry(conn, id, checkpoint)
}

fn update_availability(conn: &Connection, id: CarrierId, available: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE carriers SET available = ?1, in_transit = ?2, updated_at = datetime('now')
         WHERE id = ?3",
        params![available, !available, id],
    )?;
    if updated == 0 {
        return Err(ConveyorError::UnknownCarrier { id });
    }
    Ok(())
}
