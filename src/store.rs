//! Local durable store: string keys to JSON values.
//!
//! Components talk to [`LocalStore`], which wraps any [`KeyValueStore`]
//! backend. Production uses [`SqliteStore`]; tests inject [`MemoryStore`].
//! Reads never fail: a missing or corrupt value comes back as the type's
//! default. Writes surface every failure to the caller.

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
#[cfg(test)]
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::db::DbState;
use crate::error::{StoreError, StoreResult};

/// Raw storage port. Values are serialized JSON text.
pub trait KeyValueStore: Send + Sync {
    fn read_raw(&self, key: &str) -> StoreResult<Option<String>>;
    fn write_raw(&self, key: &str, value: &str) -> StoreResult<()>;
    /// Deleting an absent key is not an error.
    fn delete_raw(&self, key: &str) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    db: Arc<DbState>,
}

impl SqliteStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }
}

impl KeyValueStore for SqliteStore {
    fn read_raw(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.db.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let value = conn
            .query_row(
                "SELECT store_value FROM local_store WHERE store_key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_raw(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.db.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO local_store (store_key, store_value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(store_key) DO UPDATE SET
                store_value = excluded.store_value,
                updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> StoreResult<()> {
        let conn = self.db.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute("DELETE FROM local_store WHERE store_key = ?1", params![key])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Volatile backend for ephemeral runtimes and tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    #[cfg(test)]
    faults: Mutex<Faults>,
}

#[cfg(test)]
#[derive(Default)]
struct Faults {
    reads: HashSet<String>,
    writes: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Make writes to `key` fail, as on a full disk.
    pub fn fail_writes_for(&self, key: &str) {
        self.faults.lock().unwrap().writes.insert(key.to_string());
    }

    pub fn restore_writes_for(&self, key: &str) {
        self.faults.lock().unwrap().writes.remove(key);
    }

    /// Make reads of `key` fail, as on a locked database.
    pub fn fail_reads_for(&self, key: &str) {
        self.faults.lock().unwrap().reads.insert(key.to_string());
    }

    pub fn restore_reads_for(&self, key: &str) {
        self.faults.lock().unwrap().reads.remove(key);
    }

    fn check_fault(&self, key: &str, write: bool) -> StoreResult<()> {
        let faults = self.faults.lock().map_err(|_| StoreError::Poisoned)?;
        if write && faults.writes.contains(key) {
            return Err(StoreError::Backend(format!("quota exceeded writing {key}")));
        }
        if !write && faults.reads.contains(key) {
            return Err(StoreError::Backend(format!("database is locked reading {key}")));
        }
        Ok(())
    }
}

#[cfg(not(test))]
impl MemoryStore {
    fn check_fault(&self, _key: &str, _write: bool) -> StoreResult<()> {
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn read_raw(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_fault(key, false)?;
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn write_raw(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_fault(key, true)?;
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed facade
// ---------------------------------------------------------------------------

/// Cloneable handle over a storage backend.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KeyValueStore>,
    // Serializes read-modify-write cycles issued through `update`.
    write_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn sqlite(db: Arc<DbState>) -> Self {
        Self::new(Arc::new(SqliteStore::new(db)))
    }

    /// Serialize `value` and overwrite whatever `key` held.
    pub fn store<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Serialize {
            key: key.to_string(),
            source,
        })?;
        self.backend.write_raw(key, &raw)?;
        debug!(key, bytes = raw.len(), "local store write");
        Ok(())
    }

    /// Read `key`, falling back to `T::default()` when absent or unreadable.
    pub fn get<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.get_opt(key).unwrap_or_default()
    }

    /// Read `key`; `None` when absent, unreadable, or corrupt.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.read_raw(key) {
            Ok(Some(raw)) => decode(key, &raw),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "local store read failed, treating as absent");
                None
            }
        }
    }

    pub fn remove(&self, key: &str) -> StoreResult<()> {
        self.backend.delete_raw(key)
    }

    /// Read-modify-write `key` while holding the store's write lock.
    ///
    /// The closure's return value is handed back once the new value has been
    /// written. Nothing is written if the backend read fails or the closure
    /// fails; only a corrupt stored value starts over from the default.
    pub fn update<T, R, F>(&self, key: &str, f: F) -> StoreResult<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> StoreResult<R>,
    {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut value: T = match self.backend.read_raw(key)? {
            Some(raw) => decode(key, &raw).unwrap_or_default(),
            None => T::default(),
        };
        let out = f(&mut value)?;
        self.store(key, &value)?;
        Ok(out)
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str::<T>(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "corrupt local store value, treating as absent");
            None
        }
    }
}
