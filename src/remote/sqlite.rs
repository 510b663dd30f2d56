//! SQLite-backed document store
//!
//! The self-hosted stand-in for the cloud document database. Documents are
//! JSON blobs keyed by `(collection, id)`.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{Document, DocumentStore, Query, merge_fields};
use crate::error::{Error, Result};
use crate::models::now;

/// Thread-safe document database
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("failed to create database directory: {e}"))
            })?;
        }

        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
            "#,
        )?;
        Ok(())
    }

    fn read(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    fn write(conn: &Connection, collection: &str, id: &str, doc: &Value) -> Result<()> {
        conn.execute(
            r#"INSERT OR REPLACE INTO documents (collection, id, body, updated_at)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![collection, id, serde_json::to_string(doc)?, now()],
        )?;
        Ok(())
    }

    fn collect_documents(conn: &Connection, collection: &str) -> Result<Vec<Document>> {
        let mut stmt =
            conn.prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, body) = row?;
            docs.push(Document {
                id,
                data: serde_json::from_str(&body)?,
            });
        }
        Ok(docs)
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        Self::read(&conn, collection, id)
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let conn = self.conn()?;
        Self::write(&conn, collection, id, &doc)
    }

    async fn merge(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let conn = self.conn()?;
        let mut doc = Self::read(&conn, collection, id)?
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;
        merge_fields(&mut doc, &patch);
        Self::write(&conn, collection, id, &doc)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        let docs = {
            let conn = self.conn()?;
            Self::collect_documents(&conn, &query.collection)?
        };
        Ok(query.apply(docs))
    }
}
