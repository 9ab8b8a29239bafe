//! Persisted last-confirmed pupillary distance.
//!
//! At most one value survives across sessions. It seeds the manual
//! estimator's default and is written when the user saves a result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("refusing to persist non-finite dp {0}")]
    InvalidDp(f64),
    #[error("in-memory dp store lock poisoned")]
    Poisoned,
}

/// Single-value store for the last user-confirmed DP (mm).
pub trait DpStore: Send + Sync {
    /// The stored DP, or `None` if nothing usable is stored.
    fn load(&self) -> Option<f64>;

    fn save(&self, dp_mm: f64) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDp {
    last_dp: f64,
    updated_at: DateTime<Utc>,
}

/// JSON file holding `{ "last_dp": .., "updated_at": .. }`.
#[derive(Debug, Clone)]
pub struct JsonDpStore {
    path: PathBuf,
}

impl JsonDpStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl DpStore for JsonDpStore {
    fn load(&self) -> Option<f64> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "could not read stored dp");
                return None;
            }
        };
        match serde_json::from_str::<StoredDp>(&raw) {
            Ok(stored) if stored.last_dp.is_finite() && stored.last_dp > 0.0 => {
                tracing::debug!(dp = stored.last_dp, updated_at = %stored.updated_at, "stored dp loaded");
                Some(stored.last_dp)
            }
            Ok(stored) => {
                tracing::warn!(dp = stored.last_dp, "ignoring implausible stored dp");
                None
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring corrupt dp store");
                None
            }
        }
    }

    fn save(&self, dp_mm: f64) -> Result<(), StoreError> {
        if !dp_mm.is_finite() {
            return Err(StoreError::InvalidDp(dp_mm));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let stored = StoredDp {
            last_dp: dp_mm,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_string_pretty(&stored)?;

        // Temp file then rename; readers never see a partial write.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        tracing::info!(path = %self.path.display(), dp = dp_mm, "dp persisted");
        Ok(())
    }
}

/// Process-local store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryDpStore {
    value: Mutex<Option<f64>>,
}

impl MemoryDpStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(dp_mm: f64) -> Self {
        Self {
            value: Mutex::new(Some(dp_mm)),
        }
    }
}

impl DpStore for MemoryDpStore {
    fn load(&self) -> Option<f64> {
        self.value.lock().ok().and_then(|v| *v)
    }

    fn save(&self, dp_mm: f64) -> Result<(), StoreError> {
        if !dp_mm.is_finite() {
            return Err(StoreError::InvalidDp(dp_mm));
        }
        let mut value = self.value.lock().map_err(|_| StoreError::Poisoned)?;
        *value = Some(dp_mm);
        Ok(())
    }
}
