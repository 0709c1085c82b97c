//! The progress publisher: single chokepoint between workers and both the
//! store and the subscriber broadcast channel.
//!
//! Workers never write progress or terminal states themselves; everything
//! goes through here so deduplication, liveness stamping, file settlement,
//! and the automatic-retry policy live in one place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClaimError, Error};
use crate::jobs::claim::{ClaimCoordinator, ClaimedTask};
use crate::jobs::model::FileStatus;
use crate::notify::model::PipelineNotification;
use crate::store::JobStore;

/// What was last published for a task. Progress is compared in basis points
/// so float noise does not defeat deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PublishSignature {
    basis_points: i64,
    step: Option<String>,
}

fn basis_points(progress: f64) -> i64 {
    (progress.clamp(0.0, 100.0) * 100.0).round() as i64
}

/// Deduplicating publisher. One per orchestrator.
pub struct ProgressPublisher {
    store: Arc<dyn JobStore>,
    tx: broadcast::Sender<PipelineNotification>,
    last_published: Mutex<HashMap<Uuid, PublishSignature>>,
    retry: Arc<ClaimCoordinator>,
}

impl ProgressPublisher {
    pub fn new(
        store: Arc<dyn JobStore>,
        tx: broadcast::Sender<PipelineNotification>,
        retry: Arc<ClaimCoordinator>,
    ) -> Self {
        Self {
            store,
            tx,
            last_published: Mutex::new(HashMap::new()),
            retry,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineNotification> {
        self.tx.subscribe()
    }

    /// Record progress for a running task and notify subscribers.
    ///
    /// The store write is monotonic and the broadcast is deduplicated:
    /// a report equal to or behind the last published one refreshes
    /// liveness but emits nothing.
    pub async fn report_progress(
        &self,
        claim: &ClaimedTask,
        progress: f64,
        step: Option<&str>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let applied = self
            .store
            .update_task_progress(claim.task_id, progress, now)
            .await
            .map_err(Error::Database)?;
        if !applied {
            // Task already terminal, typically reaped by recovery while the
            // executor was still streaming. Drop the report.
            debug!(task_id = %claim.task_id, "Progress report for non-running task dropped");
            return Ok(());
        }
        self.store
            .touch_liveness(claim.file_id, now)
            .await
            .map_err(Error::Database)?;

        let signature = PublishSignature {
            basis_points: basis_points(progress),
            step: step.map(str::to_string),
        };
        let should_publish = {
            let mut map = lock(&self.last_published);
            match map.get(&claim.task_id) {
                Some(last)
                    if signature.basis_points <= last.basis_points
                        && signature.step == last.step =>
                {
                    false
                }
                _ => {
                    map.insert(claim.task_id, signature.clone());
                    true
                }
            }
        };

        if should_publish {
            self.publish(PipelineNotification::Progress {
                file_uuid: claim.file_uuid,
                user_id: claim.user_id.clone(),
                task_id: claim.task_id,
                task_type: claim.task_type,
                progress: progress.clamp(0.0, 100.0),
                step: step.map(str::to_string),
            });
        }
        Ok(())
    }

    /// Settle a successful attempt: task completed, file completed.
    pub async fn report_completion(&self, claim: &ClaimedTask) -> Result<(), Error> {
        let now = Utc::now();
        let won = self
            .store
            .complete_task(claim.task_id, now)
            .await
            .map_err(Error::Database)?;
        self.forget(claim.task_id);
        if !won {
            debug!(task_id = %claim.task_id, "Completion raced a terminal transition, dropped");
            return Ok(());
        }

        let settled = self
            .store
            .finish_file(claim.file_id, claim.task_id, FileStatus::Completed, None, now)
            .await
            .map_err(Error::Database)?;
        if settled {
            info!(file_id = claim.file_id, task_id = %claim.task_id, "Task completed");
            self.publish(PipelineNotification::Terminal {
                file_uuid: claim.file_uuid,
                user_id: claim.user_id.clone(),
                task_id: claim.task_id,
                task_type: claim.task_type,
                status: FileStatus::Completed,
                error: None,
            });
        }
        Ok(())
    }

    /// Settle a failed attempt. Retriable failures leave the file in
    /// `failed` and immediately attempt an automatic retry; permanent ones
    /// park it in `error` where only a manual resubmission can revive it.
    pub async fn report_failure(
        &self,
        claim: &ClaimedTask,
        reason: &str,
        retriable: bool,
    ) -> Result<(), Error> {
        let status = if retriable {
            FileStatus::Failed
        } else {
            FileStatus::Error
        };
        if !self.settle_failed(claim, reason, status).await? {
            return Ok(());
        }

        if retriable {
            match self.retry.admit_retry(claim.file_id).await {
                Ok(next) => {
                    info!(
                        file_id = claim.file_id,
                        task_id = %next.task_id,
                        retry_count = next.retry_count,
                        "Automatic retry dispatched"
                    );
                }
                Err(ClaimError::RetriesExhausted { file_id, retry_count }) => {
                    info!(file_id, retry_count, "No retries left, file stays failed");
                }
                Err(e) => {
                    warn!(file_id = claim.file_id, error = %e, "Automatic retry not dispatched");
                }
            }
        }
        Ok(())
    }

    /// Settle a cancelled attempt. Never retried.
    pub async fn report_cancelled(&self, claim: &ClaimedTask) -> Result<(), Error> {
        info!(file_id = claim.file_id, task_id = %claim.task_id, "Task cancelled at checkpoint");
        self.settle_failed(claim, "cancelled by user", FileStatus::Error)
            .await?;
        Ok(())
    }

    async fn settle_failed(
        &self,
        claim: &ClaimedTask,
        reason: &str,
        status: FileStatus,
    ) -> Result<bool, Error> {
        let now = Utc::now();
        let won = self
            .store
            .fail_task(claim.task_id, reason, now)
            .await
            .map_err(Error::Database)?;
        self.forget(claim.task_id);
        if !won {
            debug!(task_id = %claim.task_id, "Failure raced a terminal transition, dropped");
            return Ok(false);
        }

        let settled = self
            .store
            .finish_file(claim.file_id, claim.task_id, status, Some(reason), now)
            .await
            .map_err(Error::Database)?;
        if settled {
            self.publish(PipelineNotification::Terminal {
                file_uuid: claim.file_uuid,
                user_id: claim.user_id.clone(),
                task_id: claim.task_id,
                task_type: claim.task_type,
                status,
                error: Some(reason.to_string()),
            });
        }
        Ok(settled)
    }

    /// Broadcast a notification, tolerating the no-subscribers case.
    pub fn publish(&self, notification: PipelineNotification) {
        let _ = self.tx.send(notification);
    }

    /// Drop the dedup record for a task that will never report again.
    pub fn forget(&self, task_id: Uuid) {
        lock(&self.last_published).remove(&task_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{NewMediaFile, TaskStatus, TaskType};
    use crate::store::LibSqlJobStore;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<LibSqlJobStore>,
        publisher: ProgressPublisher,
        coordinator: Arc<ClaimCoordinator>,
        queue: mpsc::Receiver<ClaimedTask>,
        events: broadcast::Receiver<PipelineNotification>,
    }

    async fn setup() -> Fixture {
        let store: Arc<LibSqlJobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let (queue_tx, queue) = mpsc::channel(8);
        let coordinator = Arc::new(ClaimCoordinator::new(store.clone(), queue_tx, true));
        let (tx, events) = broadcast::channel(32);
        let publisher = ProgressPublisher::new(store.clone(), tx, coordinator.clone());
        Fixture {
            store,
            publisher,
            coordinator,
            queue,
            events,
        }
    }

    async fn claimed_running(f: &mut Fixture) -> ClaimedTask {
        let id = f
            .store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let claim = f.coordinator.admit(id, TaskType::Transcription).await.unwrap();
        f.queue.recv().await.unwrap();
        f.store
            .mark_task_running(claim.task_id, Utc::now())
            .await
            .unwrap();
        claim
    }

    #[tokio::test]
    async fn duplicate_and_regressing_progress_suppressed() {
        let mut f = setup().await;
        let claim = claimed_running(&mut f).await;

        f.publisher.report_progress(&claim, 30.0, None).await.unwrap();
        f.publisher.report_progress(&claim, 30.0, None).await.unwrap();
        f.publisher.report_progress(&claim, 10.0, None).await.unwrap();
        f.publisher.report_progress(&claim, 55.0, None).await.unwrap();

        let first = f.events.try_recv().unwrap();
        let second = f.events.try_recv().unwrap();
        assert!(f.events.try_recv().is_err());

        match (first, second) {
            (
                PipelineNotification::Progress { progress: p1, .. },
                PipelineNotification::Progress { progress: p2, .. },
            ) => {
                assert_eq!(p1, 30.0);
                assert_eq!(p2, 55.0);
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[tokio::test]
    async fn step_change_publishes_even_at_same_progress() {
        let mut f = setup().await;
        let claim = claimed_running(&mut f).await;

        f.publisher
            .report_progress(&claim, 30.0, Some("transcribing"))
            .await
            .unwrap();
        f.publisher
            .report_progress(&claim, 30.0, Some("diarization"))
            .await
            .unwrap();

        assert!(f.events.try_recv().is_ok());
        match f.events.try_recv().unwrap() {
            PipelineNotification::Progress { step, .. } => {
                assert_eq!(step.as_deref(), Some("diarization"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_settles_file_and_broadcasts() {
        let mut f = setup().await;
        let claim = claimed_running(&mut f).await;

        f.publisher.report_completion(&claim).await.unwrap();

        let file = f.store.get_file(claim.file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Completed);
        assert!(file.active_task_id.is_none());

        match f.events.try_recv().unwrap() {
            PipelineNotification::Terminal { status, error, .. } => {
                assert_eq!(status, FileStatus::Completed);
                assert!(error.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn retriable_failure_auto_retries() {
        let mut f = setup().await;
        let claim = claimed_running(&mut f).await;

        f.publisher
            .report_failure(&claim, "gpu fell over", true)
            .await
            .unwrap();

        // A fresh attempt was claimed and queued.
        let next = f.queue.recv().await.unwrap();
        assert_ne!(next.task_id, claim.task_id);
        assert_eq!(next.retry_count, 1);

        let file = f.store.get_file(claim.file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Processing);
        assert_eq!(file.active_task_id, Some(next.task_id));
    }

    #[tokio::test]
    async fn permanent_failure_parks_in_error() {
        let mut f = setup().await;
        let claim = claimed_running(&mut f).await;

        f.publisher
            .report_failure(&claim, "unsupported codec", false)
            .await
            .unwrap();

        assert!(f.queue.try_recv().is_err());
        let file = f.store.get_file(claim.file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Error);
        assert_eq!(file.last_error_message.as_deref(), Some("unsupported codec"));
    }

    #[tokio::test]
    async fn cancellation_is_terminal_and_never_retried() {
        let mut f = setup().await;
        let claim = claimed_running(&mut f).await;

        f.publisher.report_cancelled(&claim).await.unwrap();

        assert!(f.queue.try_recv().is_err());
        let file = f.store.get_file(claim.file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Error);
        let task = f.store.get_task(claim.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn progress_after_terminal_is_dropped() {
        let mut f = setup().await;
        let claim = claimed_running(&mut f).await;
        f.publisher.report_completion(&claim).await.unwrap();
        let _ = f.events.try_recv();

        f.publisher.report_progress(&claim, 99.0, None).await.unwrap();
        assert!(f.events.try_recv().is_err());
        let task = f.store.get_task(claim.task_id).await.unwrap().unwrap();
        assert_eq!(task.progress, 100.0);
    }
}
