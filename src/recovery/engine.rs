//! The recovery engine: acts on what detection found.
//!
//! Recovery is deliberately separate from detection so that every mutation
//! re-verifies its precondition at act time. A task that reported progress
//! between the scan and the recovery attempt is left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClaimError, DatabaseError, Error, RecoveryError};
use crate::jobs::claim::ClaimCoordinator;
use crate::jobs::model::{FileStatus, MediaFileRecord, TaskStatus, TaskType};
use crate::notify::{PipelineNotification, ProgressPublisher};
use crate::recovery::detector::{StaleTask, StuckTaskDetector, liveness_instant};
use crate::store::JobStore;

const STALE_RECOVERY_MESSAGE: &str = "recovered: stale";
const RESTART_RECOVERY_MESSAGE: &str = "recovered: interrupted by restart";

/// What recovering a single task achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The task was failed and its file settled.
    Recovered,
    /// Someone else already drove the task terminal.
    AlreadyTerminal,
}

/// Counters for a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub scanned: usize,
    pub recovered: usize,
    /// Skipped because of recovery backoff or because the task turned out
    /// not to be stale on re-verification.
    pub skipped: usize,
    pub errors: usize,
}

impl RecoverySummary {
    fn absorb(&mut self, other: RecoverySummary) {
        self.scanned += other.scanned;
        self.recovered += other.recovered;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

pub struct RecoveryEngine {
    store: Arc<dyn JobStore>,
    publisher: Arc<ProgressPublisher>,
    retry: Arc<ClaimCoordinator>,
    detector: StuckTaskDetector,
    staleness_threshold: Duration,
    recovery_backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<ProgressPublisher>,
        retry: Arc<ClaimCoordinator>,
        staleness_threshold: Duration,
        recovery_backoff: Duration,
    ) -> Self {
        let detector = StuckTaskDetector::new(store.clone(), staleness_threshold);
        Self {
            store,
            publisher,
            retry,
            detector,
            staleness_threshold,
            recovery_backoff,
        }
    }

    pub fn detector(&self) -> &StuckTaskDetector {
        &self.detector
    }

    /// Recover one stale task: fail it, settle its file as `failed`, notify
    /// subscribers, and re-admit the file for a retry while budget remains.
    /// Re-verifies staleness first; recovering a task that is still
    /// reporting is refused.
    pub async fn recover_task(&self, task_id: Uuid) -> Result<RecoveryOutcome, RecoveryError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(RecoveryError::TaskNotFound { id: task_id })?;
        if task.status.is_terminal() {
            return Ok(RecoveryOutcome::AlreadyTerminal);
        }

        let file = self
            .store
            .get_file(task.media_file_id)
            .await?
            .ok_or_else(|| {
                RecoveryError::Database(DatabaseError::NotFound {
                    entity: "media_file".to_string(),
                    id: task.media_file_id.to_string(),
                })
            })?;

        let now = Utc::now();
        let silent_for = (now - liveness_instant(&file))
            .to_std()
            .unwrap_or(Duration::ZERO);
        if silent_for < self.staleness_threshold {
            return Err(RecoveryError::NotStale {
                id: task_id,
                since: silent_for,
            });
        }

        self.force_fail_task(task_id, task.task_type, &file, STALE_RECOVERY_MESSAGE, now)
            .await
    }

    /// One sweep: scan for stale tasks and recover each, honoring the
    /// per-file recovery backoff. Idempotent; a second sweep right after a
    /// clean one recovers nothing.
    pub async fn recover_all_stuck(&self) -> Result<RecoverySummary, Error> {
        let stale = self.detector.scan().await.map_err(Error::Database)?;
        self.recover_batch(stale).await
    }

    /// Recover stale tasks belonging to one user.
    pub async fn recover_for_user(&self, user_id: &str) -> Result<RecoverySummary, Error> {
        let stale: Vec<StaleTask> = self
            .detector
            .scan()
            .await
            .map_err(Error::Database)?
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect();
        self.recover_batch(stale).await
    }

    /// Recover stale tasks for every user, one batch per user.
    pub async fn recover_all_users(&self) -> Result<RecoverySummary, Error> {
        let mut summary = RecoverySummary::default();
        for user in self.store.list_user_ids().await.map_err(Error::Database)? {
            summary.absorb(self.recover_for_user(&user).await?);
        }
        Ok(summary)
    }

    async fn recover_batch(&self, stale: Vec<StaleTask>) -> Result<RecoverySummary, Error> {
        let mut summary = RecoverySummary {
            scanned: stale.len(),
            ..Default::default()
        };
        let now = Utc::now();

        for candidate in stale {
            if let Some(last) = candidate.last_recovery_attempt {
                let since = (now - last).to_std().unwrap_or(Duration::ZERO);
                if since < self.recovery_backoff {
                    debug!(
                        file_id = candidate.file_id,
                        task_id = %candidate.task_id,
                        "Recovery backoff in effect, skipping"
                    );
                    summary.skipped += 1;
                    continue;
                }
            }

            match self.recover_task(candidate.task_id).await {
                Ok(RecoveryOutcome::Recovered) => summary.recovered += 1,
                Ok(RecoveryOutcome::AlreadyTerminal) => summary.skipped += 1,
                Err(RecoveryError::NotStale { id, since }) => {
                    debug!(task_id = %id, ?since, "Task reported in time, not recovering");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(task_id = %candidate.task_id, error = %e, "Recovery failed");
                    summary.errors += 1;
                }
            }
        }

        if summary.recovered > 0 {
            info!(
                scanned = summary.scanned,
                recovered = summary.recovered,
                skipped = summary.skipped,
                "Stuck-task sweep finished"
            );
        }
        Ok(summary)
    }

    /// Repair files whose status drifted from their task ledger. The task
    /// ledger is the source of truth. Converges: a second pass right after
    /// a clean one corrects nothing.
    pub async fn reconcile_inconsistent_files(&self) -> Result<usize, Error> {
        let mut corrected = 0;
        let now = Utc::now();

        // Files stuck in `processing` with nothing live behind them. The
        // latest task decides where they land.
        for file in self
            .store
            .list_processing_without_live_task()
            .await
            .map_err(Error::Database)?
        {
            let latest = self
                .store
                .latest_task_for_file(file.id)
                .await
                .map_err(Error::Database)?;
            let (status, error) = match latest {
                Some(task) if task.status == TaskStatus::Completed => {
                    (FileStatus::Completed, None)
                }
                Some(task) if task.status == TaskStatus::Failed => (
                    FileStatus::Failed,
                    Some(
                        task.error_message
                            .unwrap_or_else(|| "task failed".to_string()),
                    ),
                ),
                Some(_) => continue,
                None => (FileStatus::Failed, Some("no task record".to_string())),
            };

            let repaired = self
                .store
                .repair_file_status(file.id, FileStatus::Processing, status, error.as_deref(), now)
                .await
                .map_err(Error::Database)?;
            if repaired {
                corrected += 1;
                info!(file_id = file.id, status = %status, "Corrected drifted file status");
                self.publisher.publish(PipelineNotification::DriftCorrected {
                    file_uuid: file.uuid,
                    user_id: file.user_id.clone(),
                    status,
                });
            }
        }

        // Pointers at terminal or missing tasks on otherwise-settled files.
        for file in self
            .store
            .list_files_with_drifted_pointer()
            .await
            .map_err(Error::Database)?
        {
            if self
                .store
                .release_drifted_pointer(file.id)
                .await
                .map_err(Error::Database)?
            {
                corrected += 1;
                debug!(file_id = file.id, "Released drifted active task pointer");
            }
        }

        // The reverse drift: a live task under a file not marked processing.
        for file in self
            .store
            .list_nonprocessing_with_live_task()
            .await
            .map_err(Error::Database)?
        {
            let Some(task) = self
                .store
                .latest_task_for_file(file.id)
                .await
                .map_err(Error::Database)?
            else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            let repaired = self
                .store
                .repair_attach_live_task(file.id, task.id, now)
                .await
                .map_err(Error::Database)?;
            if repaired {
                corrected += 1;
                info!(file_id = file.id, task_id = %task.id, "Reattached live task to file");
                self.publisher.publish(PipelineNotification::DriftCorrected {
                    file_uuid: file.uuid,
                    user_id: file.user_id.clone(),
                    status: FileStatus::Processing,
                });
            }
        }

        Ok(corrected)
    }

    /// Startup recovery: after a restart nothing can actually be running,
    /// so every live task is interrupted by definition. Fail them all,
    /// re-admitting those with retry budget, then reconcile whatever drift
    /// the crash left behind.
    pub async fn startup_recovery(&self) -> Result<RecoverySummary, Error> {
        let live = self.store.list_live_tasks().await.map_err(Error::Database)?;
        let mut summary = RecoverySummary {
            scanned: live.len(),
            ..Default::default()
        };
        let now = Utc::now();

        for task in live {
            let Some(file) = self
                .store
                .get_file(task.media_file_id)
                .await
                .map_err(Error::Database)?
            else {
                summary.errors += 1;
                continue;
            };
            match self
                .force_fail_task(task.id, task.task_type, &file, RESTART_RECOVERY_MESSAGE, now)
                .await
            {
                Ok(RecoveryOutcome::Recovered) => summary.recovered += 1,
                Ok(RecoveryOutcome::AlreadyTerminal) => summary.skipped += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Startup recovery failed for task");
                    summary.errors += 1;
                }
            }
        }

        let corrected = self.reconcile_inconsistent_files().await?;
        if summary.recovered > 0 || corrected > 0 {
            info!(
                interrupted = summary.recovered,
                corrected, "Startup recovery finished"
            );
        }
        Ok(summary)
    }

    /// Fail a live task and settle its file, without a staleness check.
    async fn force_fail_task(
        &self,
        task_id: Uuid,
        task_type: TaskType,
        file: &MediaFileRecord,
        reason: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        if !self.store.fail_task(task_id, reason, now).await? {
            return Ok(RecoveryOutcome::AlreadyTerminal);
        }

        let settled = self
            .store
            .finish_file(file.id, task_id, FileStatus::Failed, Some(reason), now)
            .await?;
        if !settled {
            // Pointer points elsewhere (or nowhere). Clear it if it is
            // drift; reconciliation handles the rest.
            self.store.release_drifted_pointer(file.id).await?;
        }
        self.store.record_recovery_attempt(file.id, now).await?;

        self.publisher.forget(task_id);
        if settled {
            self.publisher.publish(PipelineNotification::Terminal {
                file_uuid: file.uuid,
                user_id: file.user_id.clone(),
                task_id,
                task_type,
                status: FileStatus::Failed,
                error: Some(reason.to_string()),
            });
        }

        info!(file_id = file.id, task_id = %task_id, reason, "Task recovered");

        // A silent death is retriable, the same as a worker-reported
        // retriable failure. If the settle lost, another claim already owns
        // the file and re-admission would only bounce off it.
        if settled {
            self.redispatch(file.id).await;
        }
        Ok(RecoveryOutcome::Recovered)
    }

    async fn redispatch(&self, file_id: i64) {
        match self.retry.admit_retry(file_id).await {
            Ok(claimed) => info!(
                file_id,
                task_id = %claimed.task_id,
                retry_count = claimed.retry_count,
                "Recovered file re-admitted for retry"
            ),
            Err(ClaimError::RetriesExhausted { retry_count, .. }) => info!(
                file_id,
                retry_count, "Recovered file has no retry budget left, staying failed"
            ),
            Err(e) => warn!(file_id, error = %e, "Failed to re-admit recovered file"),
        }
    }
}
