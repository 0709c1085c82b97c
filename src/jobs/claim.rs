//! Claim coordination: the single admission gate between "a file should be
//! processed" and "a worker is processing it".
//!
//! Every attempt gets a fresh task id. The claim itself is a conditional
//! update on `active_task_id IS NULL`; losing that race means another claim
//! (or a recovery re-dispatch) already owns the file.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ClaimError;
use crate::jobs::model::{MediaFileRecord, TaskRecord, TaskStatus, TaskType};
use crate::store::JobStore;

/// A claim that won: everything a worker needs to run the attempt.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: Uuid,
    pub file_id: i64,
    pub file_uuid: Uuid,
    pub user_id: String,
    pub task_type: TaskType,
    /// Which attempt this is, 0 for the first.
    pub retry_count: u32,
}

/// Admission gate. Owns the sending half of the worker queue.
pub struct ClaimCoordinator {
    store: Arc<dyn JobStore>,
    queue: mpsc::Sender<ClaimedTask>,
    retry_limits_enabled: bool,
}

impl ClaimCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: mpsc::Sender<ClaimedTask>,
        retry_limits_enabled: bool,
    ) -> Self {
        Self {
            store,
            queue,
            retry_limits_enabled,
        }
    }

    /// Claim a file for its first attempt and hand it to the worker pool.
    ///
    /// Resets the retry counter: a fresh submission starts a fresh budget.
    pub async fn admit(
        &self,
        file_id: i64,
        task_type: TaskType,
    ) -> Result<ClaimedTask, ClaimError> {
        let file = self.load(file_id).await?;
        self.claim(&file, task_type, 0).await
    }

    /// Claim a file for a retry after a failed attempt.
    ///
    /// Refuses once the retry budget is spent, marking the file eligible for
    /// forced deletion so it does not sit unremovable behind a dead pointer.
    pub async fn admit_retry(&self, file_id: i64) -> Result<ClaimedTask, ClaimError> {
        let file = self.load(file_id).await?;

        if self.retry_limits_enabled
            && file.max_retries > 0
            && file.retry_count >= file.max_retries
        {
            self.store.mark_retries_exhausted(file_id).await?;
            warn!(
                file_id,
                retry_count = file.retry_count,
                max_retries = file.max_retries,
                "Retry budget exhausted, marking file force-delete eligible"
            );
            return Err(ClaimError::RetriesExhausted {
                file_id,
                retry_count: file.retry_count,
            });
        }

        let task_type = self
            .store
            .latest_task_for_file(file_id)
            .await?
            .map(|t| t.task_type)
            .unwrap_or(TaskType::Transcription);

        self.claim(&file, task_type, file.retry_count + 1).await
    }

    async fn load(&self, file_id: i64) -> Result<MediaFileRecord, ClaimError> {
        self.store
            .get_file(file_id)
            .await?
            .ok_or(ClaimError::FileNotFound { file_id })
    }

    async fn claim(
        &self,
        file: &MediaFileRecord,
        task_type: TaskType,
        retry_count: u32,
    ) -> Result<ClaimedTask, ClaimError> {
        // A pointer left behind by a crashed attempt would block the claim
        // forever. Clearing is conditional on the pointed-at task being dead,
        // so a genuinely live task is never evicted here.
        self.store.release_drifted_pointer(file.id).await?;

        let task_id = Uuid::new_v4();
        let now = Utc::now();
        let task = TaskRecord {
            id: task_id,
            user_id: file.user_id.clone(),
            media_file_id: file.id,
            task_type,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        };
        // Pointer and task row commit together; a losing claim writes
        // nothing at all.
        let won = self.store.claim_file(&task, retry_count, now).await?;
        if !won {
            return Err(ClaimError::AlreadyActive { file_id: file.id });
        }

        let claimed = ClaimedTask {
            task_id,
            file_id: file.id,
            file_uuid: file.uuid,
            user_id: file.user_id.clone(),
            task_type,
            retry_count,
        };

        info!(
            file_id = file.id,
            task_id = %task_id,
            task_type = %task_type,
            retry_count,
            "Claimed file for processing"
        );

        // The claim is durable before the enqueue. If the queue is gone or
        // full the pending task simply goes stale and the recovery engine
        // reaps it; nothing is lost.
        if let Err(e) = self.queue.try_send(claimed.clone()) {
            warn!(file_id = file.id, task_id = %task_id, error = %e, "Failed to enqueue claimed task");
        }

        Ok(claimed)
    }
}
