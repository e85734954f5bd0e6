use crate::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Inbound frames larger than this are dropped without parsing.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Frames the client sends to the backend over a push channel.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Sent once per tracked task when the global feed (re)connects.
    #[serde(rename = "SUBSCRIBE")]
    Subscribe {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
    /// Periodic keepalive on a per-task channel.
    #[serde(rename = "poll")]
    Poll {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Status/progress update pushed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes ({0})")]
    Oversized(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse an inbound frame as a task update. Malformed or oversized input
/// is an error for the caller to log and skip; it never tears down the
/// connection.
pub fn parse_update(raw: &str) -> Result<TaskUpdate, FrameError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(raw.len()));
    }
    Ok(serde_json::from_str(raw)?)
}

/// Parse an inbound per-task frame as arbitrary JSON, forwarded verbatim
/// to the consumer.
pub fn parse_frame(raw: &str) -> Result<Value, FrameError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(raw.len()));
    }
    Ok(serde_json::from_str(raw)?)
}
