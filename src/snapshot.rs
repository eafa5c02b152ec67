//! Per-item state persisted between runs.
//!
//! One JSON file per item id under the cache directory, recording what the
//! last pass saw and did. The skip check reads it to avoid re-reconciling
//! items nothing has touched; a corrupt file is removed and treated as if no
//! snapshot existed.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::actions::ActionSet;
use crate::error::{Result, ShepherdError};

/// Record of one completed pass over one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub number: u64,
    /// Tracker-side update timestamp at pass time
    pub updated_at: DateTime<Utc>,
    /// Wall time this pass finished
    pub time: DateTime<Utc>,
    /// Full fact record of the pass
    pub facts: serde_json::Value,
    /// Finalized action record of the pass
    pub actions: ActionSet,
    /// A rebuild was queued and should be re-polled until it lands
    #[serde(default)]
    pub needs_rebuild: bool,
    /// An admin merge was pending
    #[serde(default)]
    pub admin_merge: bool,
    /// CI run the failure comment was posted for, if any
    #[serde(default)]
    pub notified_ci_run: Option<u64>,
}

/// Directory-backed snapshot storage keyed by item id.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{number}.json"))
    }

    /// Load the previous pass for an item. A file that fails to parse is
    /// removed so the next pass starts clean.
    pub fn load(&self, number: u64) -> Result<Option<ItemSnapshot>> {
        let path = self.path_for(number);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        match serde_json::from_slice(&data) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                error!(
                    item = number,
                    path = %path.display(),
                    %err,
                    "could not parse snapshot, removing it"
                );
                std::fs::remove_file(&path)?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, snapshot: &ItemSnapshot) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(snapshot.number);
        let data = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&path, data).map_err(|e| {
            ShepherdError::snapshot(snapshot.number, format!("write {}: {e}", path.display()))
        })?;
        debug!(item = snapshot.number, path = %path.display(), "snapshot saved");
        Ok(())
    }
}
