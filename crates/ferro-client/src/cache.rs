use ferro_core::store::Dashboard;
use ferro_core::{Task, TaskId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Best-effort snapshot of the task list and selection between sessions.
/// Never authoritative: the backend's `GET /tasks` wins on startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub active_task_id: Option<TaskId>,
}

impl CacheSnapshot {
    /// Provisional drafts are never persisted; they are discarded, not
    /// cached.
    pub fn from_dashboard(dashboard: &Dashboard) -> Self {
        CacheSnapshot {
            tasks: dashboard
                .tasks()
                .iter()
                .filter(|task| !task.is_provisional())
                .cloned()
                .collect(),
            active_task_id: dashboard
                .active()
                .filter(|id| !id.is_provisional())
                .cloned(),
        }
    }
}

/// Load the snapshot if one exists. Any failure logs and returns `None`;
/// a broken cache must never block startup.
pub fn load(path: &Path) -> Option<CacheSnapshot> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            debug!("no usable cache at {}: {err}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!("ignoring unreadable cache at {}: {err}", path.display());
            None
        }
    }
}

pub fn save(path: &Path, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
    let serialized = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, serialized)?;
    Ok(())
}
