//! Notification payloads broadcast to pipeline subscribers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::{FileStatus, TaskType};

/// A pipeline event as delivered to subscribers. Serializes with a `type`
/// tag so a UI can dispatch on it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineNotification {
    /// A running task moved forward.
    Progress {
        file_uuid: Uuid,
        user_id: String,
        task_id: Uuid,
        task_type: TaskType,
        /// Percent complete in [0, 100].
        progress: f64,
        /// Human-readable pipeline step, e.g. "diarization".
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },
    /// A task reached a terminal state and the file settled.
    Terminal {
        file_uuid: Uuid,
        user_id: String,
        task_id: Uuid,
        task_type: TaskType,
        status: FileStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Reconciliation corrected a file whose status had drifted from the
    /// task ledger.
    DriftCorrected {
        file_uuid: Uuid,
        user_id: String,
        status: FileStatus,
    },
}

impl PipelineNotification {
    /// The user this notification belongs to, for per-user fan-out.
    pub fn user_id(&self) -> &str {
        match self {
            Self::Progress { user_id, .. }
            | Self::Terminal { user_id, .. }
            | Self::DriftCorrected { user_id, .. } => user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_serializes_with_type_tag() {
        let n = PipelineNotification::Progress {
            file_uuid: Uuid::nil(),
            user_id: "alice".to_string(),
            task_id: Uuid::nil(),
            task_type: TaskType::Transcription,
            progress: 42.5,
            step: Some("diarization".to_string()),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["progress"], 42.5);
        assert_eq!(json["step"], "diarization");
    }

    #[test]
    fn terminal_omits_absent_error() {
        let n = PipelineNotification::Terminal {
            file_uuid: Uuid::nil(),
            user_id: "alice".to_string(),
            task_id: Uuid::nil(),
            task_type: TaskType::Transcription,
            status: FileStatus::Completed,
            error: None,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "terminal");
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
    }
}
