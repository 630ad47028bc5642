//! Shared external coordination state.
//!
//! The orchestrator and the watchdog are separate OS processes. They
//! coordinate exclusively through this small key-value surface — never
//! through shared memory — so a hang or crash in one cannot silence the
//! other. Keys hold one JSON record each; TTL semantics live in the records
//! themselves (readers judge age against an injected clock).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{BfError, BfResult};

/// Advisory lock written by the recording frontend. Read-only here.
pub const LOCK_KEY: &str = "recording-lock";
/// Orchestrator liveness marker, consumed by the watchdog.
pub const LIVENESS_KEY: &str = "batch-liveness";
/// Retry embargo written by the watchdog after a forced termination.
pub const BACKOFF_KEY: &str = "batch-backoff";
/// Durable manual-intervention alert record.
pub const ALERT_KEY: &str = "manual-intervention-alert";

pub trait MarkerStore: Send + Sync {
    fn get(&self, key: &str) -> BfResult<Option<Value>>;
    fn set(&self, key: &str, value: &Value) -> BfResult<()>;
    fn delete(&self, key: &str) -> BfResult<()>;
}

/// Typed read of a marker record. A record that exists but does not parse is
/// an error, not `None` — corruption must be visible, not silently ignored.
pub fn read_marker<T: DeserializeOwned>(
    store: &dyn MarkerStore,
    key: &str,
) -> BfResult<Option<T>> {
    match store.get(key)? {
        None => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|error| BfError::Marker {
                key: key.to_owned(),
                reason: format!("corrupt record: {error}"),
            }),
    }
}

pub fn write_marker<T: Serialize>(
    store: &dyn MarkerStore,
    key: &str,
    record: &T,
) -> BfResult<()> {
    let value = serde_json::to_value(record)?;
    store.set(key, &value)
}

// ---------------------------------------------------------------------------
// Filesystem-backed store
// ---------------------------------------------------------------------------

/// One file per key under the state directory, written atomically via a
/// temp-file rename so the watchdog never observes a half-written record.
#[derive(Debug)]
pub struct FsMarkerStore {
    dir: PathBuf,
}

impl FsMarkerStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl MarkerStore for FsMarkerStore {
    fn get(&self, key: &str) -> BfResult<Option<Value>> {
        let path = self.path_for(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(BfError::Marker {
                    key: key.to_owned(),
                    reason: error.to_string(),
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|error| BfError::Marker {
                key: key.to_owned(),
                reason: format!("unparseable record: {error}"),
            })
    }

    fn set(&self, key: &str, value: &Value) -> BfResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> BfResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(BfError::Marker {
                key: key.to_owned(),
                reason: error.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store for deterministic tests
// ---------------------------------------------------------------------------

/// In-memory marker store. Backs deterministic tests of the orchestrator and
/// watchdog; `fail_reads` simulates an unreachable lock/marker backend.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    records: Mutex<HashMap<String, Value>>,
    fail_reads: AtomicBool,
}

impl MemoryMarkerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `get` fail, simulating a store outage.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn get(&self, key: &str) -> BfResult<Option<Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BfError::Marker {
                key: key.to_owned(),
                reason: "simulated store outage".to_owned(),
            });
        }
        Ok(self.records.lock().expect("marker lock").get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> BfResult<()> {
        self.records
            .lock()
            .expect("marker lock")
            .insert(key.to_owned(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> BfResult<()> {
        self.records.lock().expect("marker lock").remove(key);
        Ok(())
    }
}
