//! Persistent keyed store with JSON values.
//!
//! Backs the realtime delay history (`history.db`) and the static connection
//! ledger (`connections.db`). A store is opened once and shared for the
//! lifetime of an index generation; it is closed explicitly before being
//! replaced.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::model::{DelayObservation, HistoryRecord};

pub struct HistoryStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl HistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        info!(path = %path.display(), "History store opened");
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    fn guard(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Store("history store lock poisoned".to_string()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.guard()?;
        let conn = guard.as_ref().ok_or_else(|| {
            PipelineError::Store(format!("{} is closed", self.path.display()))
        })?;
        f(conn)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM entries WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(s) => Ok(Some(serde_json::from_str(&s)?)),
                None => Ok(None),
            }
        })
    }

    /// Inserts or replaces the value under `key`.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO entries (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, json],
            )?;
            Ok(())
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Closes the underlying handle. Further access fails; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.guard()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| PipelineError::from(e))?;
            debug!(path = %self.path.display(), "History store closed");
        }
        Ok(())
    }
}

/// A store write held back until the change event it accounts for has been
/// delivered. Dropping it uncommitted leaves the store untouched, so the
/// connection is produced again on the next cycle.
#[derive(Debug)]
pub struct PendingWrite {
    store: Arc<HistoryStore>,
    key: String,
    entry: PendingEntry,
}

#[derive(Debug)]
enum PendingEntry {
    Fingerprint(String),
    Observation {
        service_date: String,
        observation: DelayObservation,
    },
}

impl PendingWrite {
    /// Replaces the value under `key` with `fingerprint`.
    pub fn fingerprint(store: Arc<HistoryStore>, key: String, fingerprint: String) -> Self {
        Self {
            store,
            key,
            entry: PendingEntry::Fingerprint(fingerprint),
        }
    }

    /// Merges `observation` for `service_date` into the [`HistoryRecord`] under `key`.
    pub fn observation(
        store: Arc<HistoryStore>,
        key: String,
        service_date: String,
        observation: DelayObservation,
    ) -> Self {
        Self {
            store,
            key,
            entry: PendingEntry::Observation {
                service_date,
                observation,
            },
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn commit(self) -> Result<()> {
        match self.entry {
            PendingEntry::Fingerprint(print) => self.store.put(&self.key, &print),
            PendingEntry::Observation {
                service_date,
                observation,
            } => {
                let mut record: HistoryRecord = self.store.get(&self.key)?.unwrap_or_default();
                record.insert(service_date, observation);
                self.store.put(&self.key, &record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_and_update_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.db")).unwrap();
        assert!(store.get::<HistoryRecord>("k").unwrap().is_none());

        let mut rec = HistoryRecord::new();
        rec.insert(
            "20220707".into(),
            DelayObservation {
                departure_delay: 713,
                arrival_delay: 713,
                cancelled: false,
            },
        );
        store.put("k", &rec).unwrap();
        rec.get_mut("20220707").unwrap().departure_delay = 744;
        store.put("k", &rec).unwrap();

        let back: HistoryRecord = store.get("k").unwrap().unwrap();
        assert_eq!(back["20220707"].departure_delay, 744);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        let store = HistoryStore::open(&path).unwrap();
        store.put("a", &serde_json::json!({"x": 1})).unwrap();
        store.close().unwrap();

        let reopened = HistoryStore::open(&path).unwrap();
        let v: serde_json::Value = reopened.get("a").unwrap().unwrap();
        assert_eq!(v["x"], 1);
    }

    #[test]
    fn test_closed_store_rejects_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("h.db")).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(
            store.get::<HistoryRecord>("k"),
            Err(PipelineError::Store(_))
        ));
    }

    #[test]
    fn test_pending_writes_apply_only_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::open(dir.path().join("h.db")).unwrap());
        let observation = DelayObservation {
            departure_delay: 60,
            arrival_delay: 90,
            cancelled: false,
        };

        let dropped = PendingWrite::observation(store.clone(), "k".into(), "20220707".into(), observation);
        assert_eq!(dropped.key(), "k");
        drop(dropped);
        assert!(store.get::<HistoryRecord>("k").unwrap().is_none());

        PendingWrite::observation(store.clone(), "k".into(), "20220707".into(), observation)
            .commit()
            .unwrap();
        PendingWrite::observation(store.clone(), "k".into(), "20220708".into(), observation)
            .commit()
            .unwrap();
        let record: HistoryRecord = store.get("k").unwrap().unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record["20220708"].arrival_delay, 90);

        PendingWrite::fingerprint(store.clone(), "t0/1/20220707".into(), "a|b".into())
            .commit()
            .unwrap();
        assert_eq!(store.get::<String>("t0/1/20220707").unwrap().as_deref(), Some("a|b"));
    }
}
