//! Snapshot I/O
//!
//! The whole want graph persists to a single YAML file: loaded once at
//! startup, written once at quiesce. Writes go to a sibling temp file and
//! rename into place so a crash never leaves a torn snapshot. In-flight
//! agent workers are never serialized; restored wants land in `idle` so the
//! engine re-derives readiness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::state::StateEntry;
use crate::want::Want;

/// One want plus its committed state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WantSnapshot {
    /// The want entity
    #[serde(flatten)]
    pub want: Want,
    /// Committed state entries
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, StateEntry>,
}

/// The full graph as persisted and as served by `GET /wants`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GraphSnapshot {
    /// The engine run that produced the snapshot
    pub execution_id: Uuid,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Every live want
    pub wants: Vec<WantSnapshot>,
}

/// Write the snapshot atomically (write-then-rename)
pub fn save<P: AsRef<Path>>(path: P, snapshot: &GraphSnapshot) -> EngineResult<()> {
    let path = path.as_ref();
    let content = serde_yaml::to_string(snapshot)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), wants = snapshot.wants.len(), "snapshot saved");
    Ok(())
}

/// Load a snapshot; `Ok(None)` when the file does not exist
pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Option<GraphSnapshot>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let snapshot: GraphSnapshot = serde_yaml::from_str(&content)?;
    info!(path = %path.display(), wants = snapshot.wants.len(), "snapshot loaded");
    Ok(Some(snapshot))
}
