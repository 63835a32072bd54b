//! Persisted instrument state
//!
//! A flat keyword -> integer store saved as JSON. Used for the calibration
//! history (key -> last completion, epoch milliseconds) and for the
//! configuration id counter, both of which must survive restarts.

use crate::config::{DayCalibrationCandidate, TwilightCalibrationCandidate};
use crate::error::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const CONFIG_ID_KEY: &str = "config.id";

/// Flat keyword -> value map backed by a JSON file
#[derive(Debug, Default)]
pub struct KeyValueStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, i64>,
}

impl KeyValueStore {
    /// Load the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path: Some(path),
            values,
        })
    }

    /// Store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    pub fn set(&mut self, key: impl Into<String>, value: i64) {
        self.values.insert(key.into(), value);
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the store atomically (temp file, then rename)
    pub fn save(&self) -> Result<(), StoreError> {
        self.write(&self.values)
    }

    /// Set `key` only once the store with the new value is on disk. A failed
    /// write leaves memory unchanged.
    pub fn set_and_save(&mut self, key: impl Into<String>, value: i64) -> Result<(), StoreError> {
        let mut values = self.values.clone();
        values.insert(key.into(), value);
        self.write(&values)?;
        self.values = values;
        Ok(())
    }

    fn write(&self, values: &BTreeMap<String, i64>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(values).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

/// Last completion time of each calibration.
///
/// Recorded times only move forward: recording an older time than the one
/// already stored keeps the stored one.
#[derive(Debug)]
pub struct CalibrationHistory {
    store: Mutex<KeyValueStore>,
}

impl CalibrationHistory {
    pub fn new(store: KeyValueStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::new(KeyValueStore::open(path)?))
    }

    pub fn in_memory() -> Self {
        Self::new(KeyValueStore::in_memory())
    }

    pub fn last_completed(&self, key: &str) -> Option<DateTime<Utc>> {
        let millis = self.lock().get(key)?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Record a completed batch and persist immediately
    pub fn record_completion(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut store = self.lock();
        let millis = at.timestamp_millis();
        let value = store.get(key).map_or(millis, |previous| previous.max(millis));
        store.set_and_save(key, value)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeyValueStore> {
        // The store holds plain data; a poisoned lock still has a usable map
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// History key of a day calibration: type, binning, exposure length and count
pub fn day_calibration_key(candidate: &DayCalibrationCandidate) -> String {
    format!(
        "day.{}.{}.{}.{}",
        candidate.calibration_type.as_str(),
        candidate.binning,
        candidate.effective_exposure_ms(),
        candidate.count
    )
}

/// History key of a twilight flat
pub fn twilight_calibration_key(candidate: &TwilightCalibrationCandidate) -> String {
    format!("twilight.flat.{}", candidate.binning)
}

/// Monotonic configuration id, persisted across restarts
#[derive(Debug)]
pub struct ConfigIdCounter {
    store: Mutex<KeyValueStore>,
}

impl ConfigIdCounter {
    pub fn new(store: KeyValueStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::new(KeyValueStore::open(path)?))
    }

    pub fn in_memory() -> Self {
        Self::new(KeyValueStore::in_memory())
    }

    pub fn current(&self) -> i64 {
        self.lock().get(CONFIG_ID_KEY).unwrap_or(0)
    }

    /// Increment, persist and return the new id
    pub fn next(&self) -> Result<i64, StoreError> {
        let mut store = self.lock();
        let id = store.get(CONFIG_ID_KEY).unwrap_or(0) + 1;
        store.set_and_save(CONFIG_ID_KEY, id)?;
        Ok(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeyValueStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
