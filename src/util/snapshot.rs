use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::IngestConfig;
use crate::error::IngestError;

/// JSON dumps of merged runs, keyed by the paginated range. Disabled unless
/// `PARA_DEBUG_CACHE` is set; a disabled cache never touches the filesystem.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    enabled: bool,
    dir: PathBuf,
}

impl SnapshotCache {
    pub fn new(enabled: bool, dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            dir: dir.into(),
        }
    }

    pub fn from_config(cfg: &IngestConfig) -> Self {
        Self::new(cfg.debug_cache, cfg.debug_cache_dir.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn range_path(&self, start: i64, end: i64) -> PathBuf {
        self.dir.join(format!("rounds_{start}_{end}.json"))
    }

    /// Returns the written path, or `None` when disabled.
    pub fn store<T: Serialize + ?Sized>(
        &self,
        start: i64,
        end: i64,
        value: &T,
    ) -> Result<Option<PathBuf>, IngestError> {
        if !self.enabled {
            return Ok(None);
        }
        let path = self.range_path(start, end);
        fs::create_dir_all(&self.dir).map_err(|e| snapshot_err(&self.dir, e))?;
        let body = serde_json::to_vec_pretty(value).map_err(|e| snapshot_err(&path, e))?;
        fs::write(&path, body).map_err(|e| snapshot_err(&path, e))?;
        info!(path = %path.display(), "snapshot written");
        Ok(Some(path))
    }

    /// Cached value for a range, if enabled and present.
    pub fn lookup<T: DeserializeOwned>(&self, start: i64, end: i64) -> Result<Option<T>, IngestError> {
        if !self.enabled {
            return Ok(None);
        }
        let path = self.range_path(start, end);
        if !path.is_file() {
            debug!(path = %path.display(), "no snapshot for range");
            return Ok(None);
        }
        read_snapshot(&path).map(Some)
    }
}

/// Loads an explicit snapshot file (the `replay` path), regardless of the toggle.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T, IngestError> {
    let body = fs::read(path).map_err(|e| snapshot_err(path, e))?;
    serde_json::from_slice(&body).map_err(|e| snapshot_err(path, e))
}

fn snapshot_err(path: &Path, e: impl std::fmt::Display) -> IngestError {
    IngestError::Snapshot {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}
