//! Flat string key/value storage for the fully-local user mode
//!
//! Values are JSON-encoded strings under a single flat namespace, mirroring
//! browser local storage. Besides the raw `get_item`/`set_item` calls, which
//! also hold small preference blobs, it offers typed helpers for the keys the
//! sync layer uses.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::models::{Sprint, UserProgress};

const KEY_PREFIX: &str = "elevatr_";
const LOCAL_USER_KEY: &str = "elevatr_local_user";
const GUEST_ID_KEY: &str = "elevatr_guest_id";

/// The fully-local user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    pub id: String,
    #[serde(default)]
    pub original_remote_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub created_at: String,
}

fn sprints_key(user_id: &str) -> String {
    format!("{KEY_PREFIX}sprints_{user_id}")
}

fn progress_key(user_id: &str, sprint_id: &str) -> String {
    format!("{KEY_PREFIX}progress_{user_id}_{sprint_id}")
}

/// Thread-safe key/value store
pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("failed to create local storage directory: {e}"))
            })?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove_item(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_item(key)?
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set_item(key, &serde_json::to_string(value)?)
    }

    // Guest id marker (stored as a plain string)

    pub fn guest_id(&self) -> Result<Option<String>> {
        self.get_item(GUEST_ID_KEY)
    }

    pub fn set_guest_id(&self, id: &str) -> Result<()> {
        self.set_item(GUEST_ID_KEY, id)
    }

    // Local user

    pub fn local_user(&self) -> Result<Option<LocalUser>> {
        self.get_json(LOCAL_USER_KEY)
    }

    pub fn set_local_user(&self, user: &LocalUser) -> Result<()> {
        self.set_json(LOCAL_USER_KEY, user)
    }

    pub fn clear_local_user(&self) -> Result<()> {
        self.remove_item(LOCAL_USER_KEY)
    }

    // Per-user data

    pub fn sprints(&self, user_id: &str) -> Result<Vec<Sprint>> {
        Ok(self.get_json(&sprints_key(user_id))?.unwrap_or_default())
    }

    pub fn set_sprints(&self, user_id: &str, sprints: &[Sprint]) -> Result<()> {
        self.set_json(&sprints_key(user_id), sprints)
    }

    pub fn progress(&self, user_id: &str, sprint_id: &str) -> Result<Option<UserProgress>> {
        self.get_json(&progress_key(user_id, sprint_id))
    }

    pub fn set_progress(&self, progress: &UserProgress) -> Result<()> {
        self.set_json(&progress_key(&progress.user_id, &progress.sprint_id), progress)
    }

    /// Progress records for every sprint stored for `user_id`
    pub fn all_progress(&self, user_id: &str) -> Result<Vec<UserProgress>> {
        let mut records = Vec::new();
        for sprint in self.sprints(user_id)? {
            if let Some(progress) = self.progress(user_id, &sprint.id)? {
                records.push(progress);
            }
        }
        Ok(records)
    }

    /// Remove the sprints of one user and the progress blobs of those sprints
    pub fn clear_user_data(&self, user_id: &str) -> Result<usize> {
        let mut keys: Vec<String> = self
            .sprints(user_id)?
            .iter()
            .map(|sprint| progress_key(user_id, &sprint.id))
            .collect();
        keys.push(sprints_key(user_id));
        for key in &keys {
            self.remove_item(key)?;
        }
        Ok(keys.len())
    }
}
