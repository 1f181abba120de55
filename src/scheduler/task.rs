use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Open key/value mapping used for task params and results.
pub type JsonObject = Map<String, Value>;

/// The closed set of work a task can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Analysis,
    Conversion,
    TestGeneration,
    Batch,
    GitClone,
    GitAnalyze,
    GitHistory,
    GitDiff,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Conversion => "conversion",
            Self::TestGeneration => "test_generation",
            Self::Batch => "batch",
            Self::GitClone => "git_clone",
            Self::GitAnalyze => "git_analyze",
            Self::GitHistory => "git_history",
            Self::GitDiff => "git_diff",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "conversion" => Ok(Self::Conversion),
            "test_generation" => Ok(Self::TestGeneration),
            "batch" => Ok(Self::Batch),
            "git_clone" => Ok(Self::GitClone),
            "git_analyze" => Ok(Self::GitAnalyze),
            "git_history" => Ok(Self::GitHistory),
            "git_diff" => Ok(Self::GitDiff),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses admit no further mutation; the record is only ever
    /// removed by the retention sweeper.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Check whether a task in the given status may still be cancelled.
///
/// Only queued-but-not-started tasks qualify; once a worker has picked a
/// task up there is no abort hook into the external executor.
pub fn is_cancellable(status: &TaskStatus) -> bool {
    matches!(status, TaskStatus::Pending)
}

/// Validate a status transition against the lifecycle state machine.
pub fn is_valid_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Cancelled)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed)
    )
}

/// One schedulable unit of asynchronous work.
///
/// `result` and `error` are mutually exclusive; at most one is ever set,
/// and only once, when the task reaches `completed` or `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub name: String,
    pub description: String,
    pub params: JsonObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0-100, non-decreasing while running, pinned to 100 on completed/failed.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(kind: TaskKind, name: &str, description: &str, params: JsonObject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: TaskStatus::Pending,
            name: name.to_string(),
            description: description.to_string(),
            params,
            result: None,
            error: None,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}
