//! Statistics persistence
//!
//! Counters are written as JSON through a temporary file and a rename, so a
//! crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use rtu_gateway::StatsSnapshot;
use tracing::{debug, warn};

use crate::error::{GatewaySrvError, Result};

/// JSON snapshot file of the gateway statistics
#[derive(Debug, Clone)]
pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last snapshot, `None` when no file exists yet
    pub fn load(&self) -> Result<Option<StatsSnapshot>> {
        if !self.path.exists() {
            debug!("No stats file at {}", self.path.display());
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&content).map_err(|e| {
            GatewaySrvError::StorageError(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(snapshot))
    }

    /// Load, treating a corrupt file as empty
    pub fn load_or_default(&self) -> StatsSnapshot {
        match self.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => StatsSnapshot::default(),
            Err(e) => {
                warn!("Stats load failed, starting from zero: {}", e);
                StatsSnapshot::default()
            },
        }
    }

    pub fn save(&self, snapshot: &StatsSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            "Stats saved: {} slaves to {}",
            snapshot.slaves.len(),
            self.path.display()
        );
        Ok(())
    }
}
