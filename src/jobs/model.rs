//! File and task records, status enums, and transition rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a media file (the owning entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Admitted, waiting for a worker.
    Pending,
    /// A task is (believed to be) working on it.
    Processing,
    /// Processing finished successfully.
    Completed,
    /// Processing failed; may still be retried manually.
    Failed,
    /// Processing was cancelled or failed in a way retries cannot fix.
    Error,
}

impl FileStatus {
    /// Whether this status admits no further automatic work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single processing attempt. One-directional:
/// pending → running → {completed, failed}. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A task that is pending or running counts against invariant 1.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of pipeline task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Primary processing: transcription + diarization of the media.
    Transcription,
    /// Derived analysis over a finished transcript.
    Summarization,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Summarization => "summarization",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "summarization" => Self::Summarization,
            _ => Self::Transcription,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media file row: the owning record whose processing lifecycle is tracked.
#[derive(Debug, Clone, Serialize)]
pub struct MediaFileRecord {
    /// Internal sequence id.
    pub id: i64,
    /// Surface-exposed stable id.
    pub uuid: Uuid,
    pub user_id: String,
    pub filename: String,
    pub status: FileStatus,
    /// The currently running task, if any. Non-null must reference a live
    /// task; anything else is drift and subject to reconciliation.
    pub active_task_id: Option<Uuid>,
    pub task_started_at: Option<DateTime<Utc>>,
    pub task_last_update: Option<DateTime<Utc>>,
    pub cancellation_requested: bool,
    pub retry_count: u32,
    /// Retry budget; 0 means unlimited when retry limits are enabled.
    pub max_retries: u32,
    pub last_error_message: Option<String>,
    /// True once retries are exhausted and the file is judged unrecoverable,
    /// so a user may delete it despite an apparently-active task pointer.
    pub force_delete_eligible: bool,
    pub recovery_attempts: u32,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One processing attempt for a media file. A fresh id is allocated for
/// every attempt; stale task ids are never reused.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: String,
    pub media_file_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Percent complete in [0, 100].
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fields needed to register a new media file with the store.
#[derive(Debug, Clone)]
pub struct NewMediaFile {
    pub uuid: Uuid,
    pub user_id: String,
    pub filename: String,
    pub max_retries: u32,
}

impl NewMediaFile {
    pub fn new(user_id: impl Into<String>, filename: impl Into<String>, max_retries: u32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            user_id: user_id.into(),
            filename: filename.into(),
            max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn task_transitions_never_regress() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn live_and_terminal_are_complementary() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.is_live(), !status.is_terminal());
        }
    }

    #[test]
    fn file_terminal_states() {
        assert!(FileStatus::Completed.is_terminal());
        assert!(FileStatus::Failed.is_terminal());
        assert!(FileStatus::Error.is_terminal());
        assert!(!FileStatus::Pending.is_terminal());
        assert!(!FileStatus::Processing.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Processing,
            FileStatus::Completed,
            FileStatus::Failed,
            FileStatus::Error,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), status);
        }
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn task_status_serde_matches_db_strings() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Running);
    }
}
