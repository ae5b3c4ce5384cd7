//! Domain entities and status enums
//!
//! Five persisted entities (project, task, task step state, task event,
//! watch progress) plus the status vocabularies the store enforces. Statuses
//! are stored as lower-snake TEXT and exposed with the same spelling over
//! the API.

mod source;

pub use source::{derive_source_url, parse_source, VideoSource};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Project lifecycle status. Mirrors the most recently committed pipeline
/// step until the task reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Queued,
    Downloading,
    Asr,
    Translating,
    Completed,
    Failed,
    Canceling,
    Canceled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Queued => "queued",
            ProjectStatus::Downloading => "downloading",
            ProjectStatus::Asr => "asr",
            ProjectStatus::Translating => "translating",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Canceling => "canceling",
            ProjectStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(ProjectStatus::Queued),
            "downloading" => Ok(ProjectStatus::Downloading),
            "asr" => Ok(ProjectStatus::Asr),
            "translating" => Ok(ProjectStatus::Translating),
            "completed" => Ok(ProjectStatus::Completed),
            "failed" => Ok(ProjectStatus::Failed),
            "canceling" => Ok(ProjectStatus::Canceling),
            "canceled" => Ok(ProjectStatus::Canceled),
            other => Err(Error::Infrastructure(format!(
                "Unknown project status in database: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Canceling,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Canceling => "canceling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "canceling" => Ok(TaskStatus::Canceling),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(Error::Infrastructure(format!(
                "Unknown task status in database: {other}"
            ))),
        }
    }

    /// Terminal statuses never transition again (except via explicit retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "canceled" => Ok(StepStatus::Canceled),
            other => Err(Error::Infrastructure(format!(
                "Unknown step status in database: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StepStart,
    StepEnd,
    Log,
    Error,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StepStart => "step_start",
            EventType::StepEnd => "step_end",
            EventType::Log => "log",
            EventType::Error => "error",
            EventType::System => "system",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "step_start" => Ok(EventType::StepStart),
            "step_end" => Ok(EventType::StepEnd),
            "log" => Ok(EventType::Log),
            "error" => Ok(EventType::Error),
            "system" => Ok(EventType::System),
            other => Err(Error::Infrastructure(format!(
                "Unknown event type in database: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Trace => "trace",
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "trace" => Ok(EventLevel::Trace),
            "debug" => Ok(EventLevel::Debug),
            "info" => Ok(EventLevel::Info),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            other => Err(Error::Infrastructure(format!(
                "Unknown event level in database: {other}"
            ))),
        }
    }
}

/// The logical job: one submitted video reference plus everything the
/// pipeline has produced for it so far.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: Uuid,
    pub source: VideoSource,
    pub source_video_id: String,
    pub original_input: String,
    pub translation_hint: Option<String>,
    pub status: ProjectStatus,
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    pub source_url: Option<String>,
    pub media_path: Option<String>,
    pub subtitle_path: Option<String>,
    pub asr_vtt_path: Option<String>,
    pub llm_cost_twd: f64,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One attempt to run the pipeline for a project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: Uuid,
    pub project_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub current_step: String,
    pub progress_percent: i64,
    pub message: String,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub cancel_requested_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Checkpoint for one named step of one task. Once completed, the row is
/// immutable except through an explicit retry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStepState {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub step: String,
    pub status: StepStatus,
    pub attempt: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub output_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only history row. Ordering by `created_at` is the canonical
/// timeline for a task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub step: String,
    pub event_type: EventType,
    pub level: EventLevel,
    pub message: String,
    pub percent: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

/// Per-viewer resume position; independent of pipeline execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchProgress {
    pub project_id: Uuid,
    pub viewer_id: String,
    pub position_sec: f64,
    pub duration_sec: f64,
    pub updated_at: i64,
}

/// Project row together with its most recent task, as returned by listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectWithLatestTask {
    #[serde(flatten)]
    pub project: Project,
    pub latest_task: Option<Task>,
}
