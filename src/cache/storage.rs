//! Versioned store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CacheMatch, CachedEntry};
use crate::proxy::RequestIdentity;

/// Named stores of (request identity -> cached response) pairs.
///
/// Every method is a single atomic operation on the backend; concurrent
/// writers to the same identity resolve last-write-wins.
pub trait VersionedStore: Send + Sync {
  /// Create the store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// All store names, oldest first.
  fn names(&self) -> Result<Vec<String>>;

  /// Delete a store and everything in it. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Insert or overwrite an entry, creating the store if needed.
  fn put(&self, name: &str, entry: &CachedEntry) -> Result<()>;

  /// Look up an entry in one store.
  fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<CachedEntry>>;

  /// Look up an entry across every store, oldest store first.
  fn match_any(&self, identity: &RequestIdentity) -> Result<Option<CacheMatch>>;
}

/// SQLite-based store implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A throwaway database that lives as long as the value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for store tables.
const STORE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per generation; id order is creation order
CREATE TABLE IF NOT EXISTS stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    store_id INTEGER NOT NULL,
    identity TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (store_id, identity),
    FOREIGN KEY (store_id) REFERENCES stores(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_identity ON entries(identity);
"#;

const ENTRY_COLUMNS: &str = "s.name, e.method, e.url, e.status, e.headers, e.body, e.cached_at";

/// Raw row before header and timestamp decoding.
struct EntryRow {
  store: String,
  method: String,
  url: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

impl EntryRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      store: row.get(0)?,
      method: row.get(1)?,
      url: row.get(2)?,
      status: row.get(3)?,
      headers: row.get(4)?,
      body: row.get(5)?,
      cached_at: row.get(6)?,
    })
  }

  fn into_match(self) -> Result<CacheMatch> {
    let headers: Vec<(String, String)> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to decode headers for {}: {}", self.url, e))?;
    let cached_at = parse_datetime(&self.cached_at)?;

    Ok(CacheMatch {
      store: self.store,
      entry: CachedEntry {
        identity: RequestIdentity {
          method: self.method,
          url: self.url,
        },
        status: self.status,
        headers,
        body: self.body.into(),
        cached_at,
      },
    })
  }
}

impl VersionedStore for SqliteStore {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("INSERT OR IGNORE INTO stores (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to create store {}: {}", name, e))?;

    Ok(())
  }

  fn names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM stores ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute("DELETE FROM stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;

    Ok(deleted > 0)
  }

  fn put(&self, name: &str, entry: &CachedEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to encode headers: {}", e))?;
    let cached_at = entry.cached_at.format(DATETIME_FORMAT).to_string();

    conn
      .execute("INSERT OR IGNORE INTO stores (name) VALUES (?)", params![name])
      .map_err(|e| eyre!("Failed to create store {}: {}", name, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (store_id, identity, method, url, status, headers, body, cached_at)
         SELECT id, ?, ?, ?, ?, ?, ?, ? FROM stores WHERE name = ?",
        params![
          entry.identity.cache_hash(),
          entry.identity.method,
          entry.identity.url,
          entry.status,
          headers,
          &entry.body[..],
          cached_at,
          name
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", entry.identity.url, name, e))?;

    Ok(())
  }

  fn get(&self, name: &str, identity: &RequestIdentity) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT {} FROM entries e INNER JOIN stores s ON s.id = e.store_id
       WHERE s.name = ? AND e.identity = ?",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![name, identity.cache_hash()], EntryRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", identity.url, name, e))?;

    row.map(|r| r.into_match().map(|m| m.entry)).transpose()
  }

  fn match_any(&self, identity: &RequestIdentity) -> Result<Option<CacheMatch>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT {} FROM entries e INNER JOIN stores s ON s.id = e.store_id
       WHERE e.identity = ?
       ORDER BY s.id
       LIMIT 1",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![identity.cache_hash()], EntryRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", identity.url, e))?;

    row.map(EntryRow::into_match).transpose()
  }
}

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
