//! Durable key/value table backed by SQLite.

use crate::error::{StorageError, StorageResult};
use crate::query::{QueryEngine, QueryOptions};
use plugos_types::{KvPair, QuerySpec};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Creates the key/value table `table` if it does not exist yet.
pub fn ensure_table(conn: &Connection, table: &str) -> StorageResult<()> {
    validate_table_name(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );"
    ))?;
    Ok(())
}

fn validate_table_name(table: &str) -> StorageResult<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StorageError::InvalidTable(table.to_string()))
    }
}

/// A schemaless document store over one SQLite table.
///
/// Writes are last-writer-wins per key. Every statement is atomic, so a
/// record is either fully written or not at all; there are no multi-record
/// transactions beyond what a single method documents.
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    engine: QueryEngine,
}

impl KvStore {
    /// Opens (or creates) a store in the database file at `path`.
    pub fn open(path: impl AsRef<Path>, table: &str) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(Arc::new(Mutex::new(conn)), table)
    }

    /// Opens a store in a private in-memory database.
    pub fn open_in_memory(table: &str) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(Arc::new(Mutex::new(conn)), table)
    }

    /// Opens a store on a connection shared with other stores.
    pub fn with_connection(conn: Arc<Mutex<Connection>>, table: &str) -> StorageResult<Self> {
        {
            let guard = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            ensure_table(&guard, table)?;
        }
        debug!(table = %table, "Key/value table ready");
        Ok(Self {
            conn,
            table: table.to_string(),
            engine: QueryEngine::default(),
        })
    }

    /// Replaces the options used by [`KvStore::query`] and [`KvStore::delete_query`].
    pub fn with_query_options(mut self, options: QueryOptions) -> Self {
        self.engine = QueryEngine::new(options);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ── Single-record operations ─────────────────────────────────

    /// Writes `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &str, value: &Value) -> StorageResult<()> {
        let json = serde_json::to_string(value)?;
        let conn = self.lock()?;
        put_locked(&conn, &self.table, key, &json)
    }

    /// Reads the value stored under `key`.
    pub fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let conn = self.lock()?;
        get_locked(&conn, &self.table, key)
    }

    /// Removes `key`. Removing an absent key is a no-op.
    pub fn delete(&self, key: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("DELETE FROM \"{}\" WHERE key = ?1", self.table),
            params![key],
        )?;
        Ok(())
    }

    /// Removes every record of the table.
    pub fn delete_all(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        let removed = conn.execute(&format!("DELETE FROM \"{}\"", self.table), [])?;
        debug!(table = %self.table, removed, "Cleared key/value table");
        Ok(())
    }

    /// Returns the number of stored records.
    pub fn count(&self) -> StorageResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Snapshot of every record at call time, in key order.
    ///
    /// The snapshot does not track later writes; call again to rescan.
    pub fn scan_all(&self) -> StorageResult<Vec<KvPair>> {
        let conn = self.lock()?;
        scan_locked(&conn, &self.table)
    }

    // ── Batch operations ─────────────────────────────────────────

    /// Writes each pair in order. Atomic per record only.
    pub fn batch_put(&self, pairs: &[KvPair]) -> StorageResult<()> {
        let conn = self.lock()?;
        for pair in pairs {
            let json = serde_json::to_string(&pair.value)?;
            put_locked(&conn, &self.table, &pair.key, &json)?;
        }
        Ok(())
    }

    /// Reads several keys, preserving the order of `keys`.
    pub fn batch_get(&self, keys: &[String]) -> StorageResult<Vec<Option<Value>>> {
        let conn = self.lock()?;
        keys.iter()
            .map(|key| get_locked(&conn, &self.table, key))
            .collect()
    }

    /// Removes several keys in one transaction and returns how many existed.
    pub fn delete_many(&self, keys: &[String]) -> StorageResult<usize> {
        let mut conn = self.lock()?;
        delete_many_locked(&mut conn, &self.table, keys)
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Evaluates `spec` over the current contents of the table.
    pub fn query(&self, spec: &QuerySpec) -> StorageResult<Vec<KvPair>> {
        let records = self.scan_all()?;
        Ok(self.engine.evaluate(spec, records)?)
    }

    /// Deletes exactly the records matched by `spec` and returns the count.
    ///
    /// Matching and deletion happen under one lock, so records written
    /// concurrently are never removed unless they matched at call time.
    pub fn delete_query(&self, spec: &QuerySpec) -> StorageResult<usize> {
        let mut conn = self.lock()?;
        let records = scan_locked(&conn, &self.table)?;
        let keys: Vec<String> = self
            .engine
            .evaluate(spec, records)?
            .into_iter()
            .map(|pair| pair.key)
            .collect();
        let removed = delete_many_locked(&mut conn, &self.table, &keys)?;
        debug!(table = %self.table, removed, "Deleted records by query");
        Ok(removed)
    }
}

fn put_locked(conn: &Connection, table: &str, key: &str, json: &str) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO \"{table}\" (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ),
        params![key, json],
    )?;
    Ok(())
}

fn get_locked(conn: &Connection, table: &str, key: &str) -> StorageResult<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM \"{table}\" WHERE key = ?1"),
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
        .transpose()
}

fn scan_locked(conn: &Connection, table: &str) -> StorageResult<Vec<KvPair>> {
    let mut stmt = conn.prepare(&format!("SELECT key, value FROM \"{table}\" ORDER BY key"))?;
    let rows = stmt.query_map([], |row| {
        let key: String = row.get(0)?;
        let value: String = row.get(1)?;
        Ok((key, value))
    })?;

    let mut pairs = Vec::new();
    for row in rows {
        let (key, json) = row?;
        let value = serde_json::from_str(&json).map_err(|e| {
            StorageError::InvalidData(format!("corrupt value for key '{key}': {e}"))
        })?;
        pairs.push(KvPair { key, value });
    }
    Ok(pairs)
}

fn delete_many_locked(conn: &mut Connection, table: &str, keys: &[String]) -> StorageResult<usize> {
    let tx = conn.transaction()?;
    let mut removed = 0;
    {
        let mut stmt = tx.prepare(&format!("DELETE FROM \"{table}\" WHERE key = ?1"))?;
        for key in keys {
            removed += stmt.execute(params![key])?;
        }
    }
    tx.commit()?;
    Ok(removed)
}
