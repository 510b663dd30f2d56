//! Embedded key-value store used as the local cache
//!
//! Holds three tables: guest snapshots keyed by guest id, cached snapshots of
//! authenticated users keyed by user id, and the queue of writes deferred
//! while the remote store was unreachable.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::models::{
    CachedUserData, EntityType, GuestSnapshot, SyncOperation, SyncQueueItem, now,
};

/// Thread-safe local cache
pub struct LocalCache {
    conn: Mutex<Connection>,
}

impl LocalCache {
    /// Open or create the cache database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("failed to create cache directory: {e}"))
            })?;
        }

        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory cache (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init()?;
        Ok(cache)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS guest_snapshots (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cached_users (
                user_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                last_sync_at TEXT NOT NULL,
                is_stale INTEGER NOT NULL DEFAULT 0
            );

            -- Deferred remote writes, replayed in id order
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_attempt TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sync_queue_user ON sync_queue(user_id, id);
            "#,
        )?;

        Ok(())
    }

    // Guest snapshots

    pub fn get_guest_snapshot(&self, id: &str) -> Result<Option<GuestSnapshot>> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM guest_snapshots WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }

    /// Overwrite the snapshot stored under `snapshot.id`
    pub fn put_guest_snapshot(&self, snapshot: &GuestSnapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO guest_snapshots (id, data, updated_at) VALUES (?1, ?2, ?3)",
            params![&snapshot.id, data, &snapshot.updated_at],
        )?;
        Ok(())
    }

    pub fn delete_guest_snapshot(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM guest_snapshots WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Remove every guest snapshot, returning how many were deleted
    pub fn clear_guest_snapshots(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM guest_snapshots", [])?)
    }

    // Cached authenticated users

    pub fn get_cached_user(&self, user_id: &str) -> Result<Option<CachedUserData>> {
        let conn = self.conn()?;
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT data, is_stale FROM cached_users WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get::<_, i32>(1)? != 0)),
            )
            .optional()?;

        let Some((data, is_stale)) = row else {
            return Ok(None);
        };
        let mut cached: CachedUserData = serde_json::from_str(&data)?;
        cached.is_stale = is_stale;
        Ok(Some(cached))
    }

    /// Replace the cached snapshot for `data.user_id`
    pub fn put_cached_user(&self, data: &CachedUserData) -> Result<()> {
        let json = serde_json::to_string(data)?;
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO cached_users (user_id, data, last_sync_at, is_stale)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![&data.user_id, json, &data.last_sync_at, data.is_stale as i32],
        )?;
        Ok(())
    }

    pub fn mark_stale(&self, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE cached_users SET is_stale = 1 WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn delete_cached_user(&self, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM cached_users WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    // Sync queue

    /// Append a deferred write, returning its queue id
    pub fn enqueue(
        &self,
        user_id: &str,
        operation: SyncOperation,
        entity_type: EntityType,
        entity_id: &str,
        data: &serde_json::Value,
    ) -> Result<i64> {
        let data = serde_json::to_string(data)?;
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO sync_queue (user_id, operation, entity_type, entity_id, data, timestamp)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                user_id,
                operation.as_str(),
                entity_type.as_str(),
                entity_id,
                data,
                now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Queued items for a user in FIFO order
    pub fn pending_for_user(&self, user_id: &str) -> Result<Vec<SyncQueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, user_id, operation, entity_type, entity_id, data, timestamp,
                      retry_count, last_attempt
               FROM sync_queue WHERE user_id = ?1 ORDER BY id ASC"#,
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, u32>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, user_id, operation, entity_type, entity_id, data, timestamp, retry_count, last_attempt) =
                row?;
            items.push(SyncQueueItem {
                id,
                user_id,
                operation: operation.parse()?,
                entity_type: entity_type.parse()?,
                entity_id,
                data: serde_json::from_str(&data)?,
                timestamp,
                retry_count,
                last_attempt,
            });
        }
        Ok(items)
    }

    pub fn pending_count(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Persist a failed attempt
    pub fn record_attempt(&self, id: i64, retry_count: u32, last_attempt: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_queue SET retry_count = ?2, last_attempt = ?3 WHERE id = ?1",
            params![id, retry_count, last_attempt],
        )?;
        Ok(())
    }

    pub fn remove_queue_item(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn clear_queue(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM sync_queue WHERE user_id = ?1",
            params![user_id],
        )?)
    }
}
