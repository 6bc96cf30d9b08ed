//! Wire types exchanged with the reverse-prompt service.
//!
//! Every response type derives `Deserialize` with `#[serde(default)]` on the
//! optional fields so that a server omitting a field produces `None` rather
//! than a parse error. Whether a missing field is a failure is decided by the
//! pipeline, not here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Response of `POST /upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `POST /analyze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResult {
    pub success: bool,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `POST /generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub success: bool,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response of `GET /result/{task_id}`: the generated images.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationResult {
    #[serde(default)]
    pub images: Vec<String>,
}

/// Lifecycle state of a remote generation task.
///
/// Unrecognised values are kept verbatim in [`TaskState::Unknown`] so the
/// poller can report exactly what it saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Unknown(String),
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Unknown(s) => s,
        }
    }
}

impl From<String> for TaskState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => TaskState::Pending,
            "processing" => TaskState::Processing,
            "completed" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "cancelled" => TaskState::Cancelled,
            _ => TaskState::Unknown(s),
        }
    }
}

impl From<TaskState> for String {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One snapshot of `GET /queue_status/{task_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    /// Percent complete, 0–100, when the server reports it.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn new(status: TaskState) -> Self {
        Self {
            status,
            progress: None,
            message: None,
            error: None,
        }
    }
}
