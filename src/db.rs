//! SQLite storage handle shared by the account registry and the result cache

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::Result;

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    provider TEXT NOT NULL CHECK (provider IN ('gmail', 'imap')),
    credentials TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    default_mailbox TEXT NOT NULL DEFAULT 'INBOX',
    urgent_keywords TEXT NOT NULL DEFAULT '[]',
    important_keywords TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_sync_at TEXT,
    last_sync_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_accounts_email ON accounts(email);

CREATE TABLE IF NOT EXISTS classifications (
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    message_id TEXT NOT NULL,
    urgency_score REAL NOT NULL,
    importance_score REAL NOT NULL,
    is_urgent INTEGER NOT NULL,
    is_important INTEGER NOT NULL,
    reasons TEXT NOT NULL,
    message TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (account_id, message_id)
);
";

/// Cloneable handle to one SQLite connection.
///
/// Every statement the crate issues is a short point read or single-row
/// upsert, so a mutex-guarded connection is sufficient.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        let db = Self::init(conn)?;
        info!("Opened account database at {:?}", path);
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Cascade deletes depend on this; SQLite leaves it off per connection
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&conn)?)
    }
}
