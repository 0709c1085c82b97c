//! Stuck-task detection. Read-only: the detector reports, the engine acts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{MediaFileRecord, TaskRecord, TaskType};
use crate::store::JobStore;

/// A live task whose file has gone silent past the staleness threshold.
#[derive(Debug, Clone)]
pub struct StaleTask {
    pub file_id: i64,
    pub file_uuid: Uuid,
    pub user_id: String,
    pub task_id: Uuid,
    pub task_type: TaskType,
    /// How long the file has been silent.
    pub staleness: Duration,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
}

/// Everything detection can say about the current state of the world.
#[derive(Debug, Default)]
pub struct DetectionReport {
    pub stale: Vec<StaleTask>,
    /// Files stuck in `processing` with no live task backing them.
    pub processing_without_task: Vec<MediaFileRecord>,
    /// Files whose active pointer references a terminal or missing task.
    pub drifted_pointer: Vec<MediaFileRecord>,
    /// Files settled (or pending) that nonetheless own a live task.
    pub settled_with_live_task: Vec<MediaFileRecord>,
}

impl DetectionReport {
    pub fn is_clean(&self) -> bool {
        self.stale.is_empty()
            && self.processing_without_task.is_empty()
            && self.drifted_pointer.is_empty()
            && self.settled_with_live_task.is_empty()
    }
}

/// Detects tasks that claim to be live but have stopped reporting, and
/// files whose status has drifted from their task ledger.
pub struct StuckTaskDetector {
    store: Arc<dyn JobStore>,
    staleness_threshold: Duration,
}

/// The timestamp staleness is measured against. Falls back through the
/// claim-time stamps for a task that never reported at all.
pub fn liveness_instant(file: &MediaFileRecord) -> DateTime<Utc> {
    file.task_last_update
        .or(file.task_started_at)
        .unwrap_or(file.created_at)
}

impl StuckTaskDetector {
    pub fn new(store: Arc<dyn JobStore>, staleness_threshold: Duration) -> Self {
        Self {
            store,
            staleness_threshold,
        }
    }

    /// Live tasks silent for longer than the staleness threshold.
    pub async fn scan(&self) -> Result<Vec<StaleTask>, DatabaseError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.staleness_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let pairs = self.store.list_stale_live_tasks(cutoff).await?;
        Ok(pairs
            .into_iter()
            .map(|(file, task)| Self::to_stale(&file, &task, now))
            .collect())
    }

    /// Full detection report: staleness plus the three drift shapes.
    pub async fn report(&self) -> Result<DetectionReport, DatabaseError> {
        Ok(DetectionReport {
            stale: self.scan().await?,
            processing_without_task: self.store.list_processing_without_live_task().await?,
            drifted_pointer: self.store.list_files_with_drifted_pointer().await?,
            settled_with_live_task: self.store.list_nonprocessing_with_live_task().await?,
        })
    }

    fn to_stale(file: &MediaFileRecord, task: &TaskRecord, now: DateTime<Utc>) -> StaleTask {
        let silent_for = (now - liveness_instant(file))
            .to_std()
            .unwrap_or(Duration::ZERO);
        StaleTask {
            file_id: file.id,
            file_uuid: file.uuid,
            user_id: file.user_id.clone(),
            task_id: task.id,
            task_type: task.task_type,
            staleness: silent_for,
            last_recovery_attempt: file.last_recovery_attempt,
        }
    }
}
