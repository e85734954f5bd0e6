use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod metrics;
pub mod store;
pub mod wire;

/// Reserved namespace for locally generated ids. The backend never issues
/// ids in this namespace, so a provisional id can never alias a confirmed
/// one.
pub const PROVISIONAL_PREFIX: &str = "pending-";

/// Task identifier. A task starts out `Provisional` (created locally,
/// before the backend has confirmed it) and becomes `Confirmed` exactly
/// once, when the create call returns the backend-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskId {
    Provisional(String),
    Confirmed(String),
}

impl TaskId {
    pub fn new_provisional() -> Self {
        TaskId::Provisional(Uuid::new_v4().to_string())
    }

    pub fn confirmed(id: impl Into<String>) -> Self {
        TaskId::Confirmed(id.into())
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, TaskId::Provisional(_))
    }

    /// Parse the string form, splitting on the reserved prefix.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(PROVISIONAL_PREFIX) {
            Some(rest) => TaskId::Provisional(rest.to_string()),
            None => TaskId::Confirmed(raw.to_string()),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Provisional(id) => write!(f, "{PROVISIONAL_PREFIX}{id}"),
            TaskId::Confirmed(id) => f.write_str(id),
        }
    }
}

impl Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(TaskId::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    /// Also covers "cancelled by user", which the backend reports as ERROR.
    Error,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "ERROR" => Ok(TaskStatus::Error),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh local draft, not yet known to the backend.
    pub fn provisional(now: DateTime<Utc>) -> Self {
        Task {
            id: TaskId::new_provisional(),
            name: String::new(),
            description: String::new(),
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The backend occasionally reports progress outside [0,100];
    /// consumers display the clamped value.
    pub fn progress_clamped(&self) -> f64 {
        self.progress.clamp(0.0, 100.0)
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    /// An empty draft: no label, no description. Drafts like this are
    /// garbage-collected when deselected without ever sending a message.
    pub fn is_untouched(&self) -> bool {
        self.name.is_empty() && self.description.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Completed,
    InProgress,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub title: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_estimate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl Message {
    pub fn user(text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            kind: MessageKind::User,
            timestamp: now,
            is_streaming: false,
            steps: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            kind: MessageKind::System,
            timestamp: now,
            is_streaming: false,
            steps: Vec::new(),
        }
    }

    pub fn streaming(text: impl Into<String>, steps: Vec<Step>, now: DateTime<Utc>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            kind: MessageKind::System,
            timestamp: now,
            is_streaming: true,
            steps,
        }
    }
}
