//! Background sweep loop: periodically runs the stuck-task recovery pass
//! and the file/task reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::recovery::engine::RecoveryEngine;

/// Spawn the sweep loop. Runs until the shutdown signal fires.
pub fn spawn(
    engine: Arc<RecoveryEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?interval, "Recovery sweeper started");
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a freshly started
        // orchestrator does not race its own startup recovery.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Recovery sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match engine.recover_all_stuck().await {
                Ok(summary) if summary.recovered > 0 || summary.errors > 0 => {
                    info!(
                        scanned = summary.scanned,
                        recovered = summary.recovered,
                        skipped = summary.skipped,
                        errors = summary.errors,
                        "Sweep pass"
                    );
                }
                Ok(_) => debug!("Sweep pass found nothing stale"),
                Err(e) => error!(error = %e, "Sweep pass failed"),
            }

            match engine.reconcile_inconsistent_files().await {
                Ok(0) => {}
                Ok(corrected) => info!(corrected, "Reconciliation pass"),
                Err(e) => error!(error = %e, "Reconciliation pass failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::claim::ClaimCoordinator;
    use crate::jobs::model::{NewMediaFile, TaskRecord, TaskStatus, TaskType};
    use crate::notify::ProgressPublisher;
    use crate::store::{JobStore, LibSqlJobStore};
    use chrono::Utc;
    use tokio::sync::{broadcast, mpsc};
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn sweeper_recovers_on_schedule_and_stops() {
        let store: Arc<LibSqlJobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let (queue_tx, mut queue_rx) = mpsc::channel(8);
        let coordinator = Arc::new(ClaimCoordinator::new(store.clone(), queue_tx, true));
        let (tx, _events) = broadcast::channel(32);
        let publisher = Arc::new(ProgressPublisher::new(
            store.clone(),
            tx,
            coordinator.clone(),
        ));
        let engine = Arc::new(RecoveryEngine::new(
            store.clone(),
            publisher,
            coordinator,
            Duration::from_secs(300),
            Duration::from_secs(600),
        ));

        // One stale claim.
        let long_ago = Utc::now() - chrono::Duration::minutes(20);
        let file_id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let task = TaskRecord {
            id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            media_file_id: file_id,
            task_type: TaskType::Transcription,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: long_ago,
            updated_at: long_ago,
            completed_at: None,
            error_message: None,
        };
        assert!(store.claim_file(&task, 0, long_ago).await.unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn(engine, Duration::from_secs(60), shutdown_rx);

        // Let the first scheduled tick run under the paused clock, then
        // poll until the sweep's writes land.
        tokio::time::sleep(Duration::from_secs(61)).await;
        let mut recovered = false;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            let stored = store.get_task(task.id).await.unwrap().unwrap();
            if stored.status == TaskStatus::Failed {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(recovered, "sweeper never recovered the stale task");

        // The recovered file was re-admitted with a fresh attempt.
        let retry = queue_rx.recv().await.unwrap();
        assert_eq!(retry.file_id, file_id);
        assert_eq!(retry.retry_count, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
