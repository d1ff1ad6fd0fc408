//! Device metadata persistence
//!
//! A [`MetadataStore`] maps a key (usually a device address) to a JSON object.
//! [`MemoryStore`] keeps entries in memory; [`JsonFileStore`] mirrors them to a
//! single JSON file after every change.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, info};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::bluetooth::Peripheral;

/// A stored metadata object
pub type Metadata = Map<String, Value>;

/// Errors from a metadata store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read store {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write store {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Store file is not a JSON object of objects: {0}")]
    Corrupt(String),

    #[error("Failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key-value persistence for device metadata
pub trait MetadataStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Metadata>;
    fn set(&self, key: &str, value: Metadata) -> Result<(), StoreError>;
    /// Remove `key`; true when it existed
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
    fn exists(&self, key: &str) -> bool;
    fn keys(&self) -> Vec<String>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Metadata>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Metadata> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: Metadata) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.entries).remove(key).is_some())
    }

    fn exists(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = lock(&self.entries).keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Store backed by one JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Metadata>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| StoreError::ReadFailed {
                path: path.clone(),
                source,
            })?;
            parse_entries(&content)?
        } else {
            Metadata::new()
        };
        debug!("[JsonFileStore::open] {} entries in {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Default location under the user's data directory
    pub fn default_path() -> PathBuf {
        dirs_next::data_local_dir()
            .map(|dir| dir.join("bluelink").join("devices.json"))
            .unwrap_or_else(|| PathBuf::from("bluelink_devices.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Metadata) -> Result<(), StoreError> {
        let write_failed = |source| StoreError::WriteFailed {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_failed)?;
            }
        }
        let content = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, content).map_err(write_failed)
    }
}

fn parse_entries(content: &str) -> Result<Metadata, StoreError> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(entries)) => {
            if let Some((key, _)) = entries.iter().find(|(_, value)| !value.is_object()) {
                return Err(StoreError::Corrupt(format!("entry {} is not an object", key)));
            }
            Ok(entries)
        }
        Ok(_) => Err(StoreError::Corrupt("top level is not an object".to_string())),
        Err(e) => Err(StoreError::Corrupt(e.to_string())),
    }
}

impl MetadataStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Metadata> {
        lock(&self.entries).get(key).and_then(Value::as_object).cloned()
    }

    /// The file is written while the lock is held so writes land in order
    fn set(&self, key: &str, value: Metadata) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        let previous = entries.insert(key.to_string(), Value::Object(value));
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = lock(&self.entries);
        let Some(previous) = entries.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    fn exists(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }
}

/// Record a sighting of `peripheral`, keyed by its address
///
/// Keeps `first_seen` and counts sightings across calls.
pub fn record_peripheral(store: &dyn MetadataStore, peripheral: &Peripheral) -> Result<(), StoreError> {
    let key = peripheral.address.to_string();
    let mut entry = store.get(&key).unwrap_or_default();

    let now = Utc::now().to_rfc3339();
    let sightings = entry.get("sightings").and_then(Value::as_u64).unwrap_or(0) + 1;
    if !entry.contains_key("first_seen") {
        entry.insert("first_seen".to_string(), json!(now));
        info!("[store::record_peripheral] new device {}", key);
    }
    entry.insert("last_seen".to_string(), json!(now));
    entry.insert("sightings".to_string(), json!(sightings));
    entry.insert("rssi".to_string(), json!(peripheral.rssi));
    if let Some(name) = peripheral.name() {
        entry.insert("name".to_string(), json!(name));
    }
    if let Some(beacon) = peripheral.ibeacon() {
        entry.insert("ibeacon".to_string(), serde_json::to_value(beacon)?);
    }

    store.set(&key, entry)
}
