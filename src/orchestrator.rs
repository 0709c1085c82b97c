//! The orchestrator: owns the channels and background tasks and exposes the
//! embedding surface (submit, cancel, subscribe, shutdown).

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{DatabaseError, Error, Result};
use crate::jobs::cancel::{self, CancellationOutcome};
use crate::jobs::claim::{ClaimCoordinator, ClaimedTask};
use crate::jobs::model::{MediaFileRecord, NewMediaFile, TaskType};
use crate::notify::{PipelineNotification, ProgressPublisher};
use crate::recovery::detector::DetectionReport;
use crate::recovery::engine::RecoveryEngine;
use crate::recovery::sweeper;
use crate::store::JobStore;
use crate::worker::executor::TaskExecutor;
use crate::worker::pool::WorkerPool;

/// A running orchestrator instance.
///
/// `start` runs startup recovery, spawns the worker pool and the recovery
/// sweeper, and returns a handle the embedding application drives. Dropping
/// it without calling [`Orchestrator::shutdown`] leaves the background
/// tasks running.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    coordinator: Arc<ClaimCoordinator>,
    publisher: Arc<ProgressPublisher>,
    engine: Arc<RecoveryEngine>,
    pool: WorkerPool,
    sweeper: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    /// Validate configuration, recover whatever a previous process left
    /// behind, and start the background machinery.
    pub async fn start(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self> {
        config.validate()?;

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let coordinator = Arc::new(ClaimCoordinator::new(
            store.clone(),
            queue_tx,
            config.retry_limits_enabled,
        ));
        let (notify_tx, _) = broadcast::channel(config.notification_capacity);
        let publisher = Arc::new(ProgressPublisher::new(
            store.clone(),
            notify_tx,
            coordinator.clone(),
        ));
        let engine = Arc::new(RecoveryEngine::new(
            store.clone(),
            publisher.clone(),
            coordinator.clone(),
            config.staleness_threshold,
            config.recovery_backoff,
        ));

        // Before any worker starts: whatever claims the previous process
        // held are dead and must not block fresh submissions.
        let startup = engine.startup_recovery().await?;
        if startup.recovered > 0 {
            info!(
                interrupted = startup.recovered,
                "Recovered tasks left behind by the previous process"
            );
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let pool = WorkerPool::spawn(
            config.worker_count,
            queue_rx,
            store.clone(),
            executor,
            publisher.clone(),
            shutdown_rx.clone(),
        );
        let sweeper = sweeper::spawn(engine.clone(), config.detector_interval, shutdown_rx);

        info!(
            workers = config.worker_count,
            detector_interval = ?config.detector_interval,
            "Orchestrator started"
        );

        Ok(Self {
            config,
            store,
            coordinator,
            publisher,
            engine,
            pool,
            sweeper,
            shutdown,
        })
    }

    /// Register a new media file, returning its record. The file sits in
    /// `pending` until submitted.
    pub async fn register_file(
        &self,
        user_id: &str,
        filename: &str,
    ) -> Result<MediaFileRecord> {
        let new = NewMediaFile::new(user_id, filename, self.config.default_max_retries);
        let id = self.store.insert_file(&new).await.map_err(Error::Database)?;
        self.store
            .get_file(id)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound {
                    entity: "media_file".to_string(),
                    id: id.to_string(),
                })
            })
    }

    /// Submit a file for processing. Claims it and queues the attempt.
    pub async fn submit(&self, file_id: i64, task_type: TaskType) -> Result<ClaimedTask> {
        Ok(self.coordinator.admit(file_id, task_type).await?)
    }

    /// Request cooperative cancellation of a file's active task.
    pub async fn request_cancellation(&self, file_id: i64) -> Result<CancellationOutcome> {
        Ok(cancel::request(self.store.as_ref(), file_id)
            .await
            .map_err(Error::Database)?)
    }

    /// Delete a file and its task history. Returns false when a live task
    /// blocks the delete; a file marked `force_delete_eligible` deletes
    /// anyway, and its orphaned worker stops at the next checkpoint.
    pub async fn delete_file(&self, file_id: i64) -> Result<bool> {
        let deleted = self
            .store
            .delete_file(file_id)
            .await
            .map_err(Error::Database)?;
        if deleted {
            info!(file_id, "Media file deleted");
        }
        Ok(deleted)
    }

    /// Subscribe to pipeline notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineNotification> {
        self.publisher.subscribe()
    }

    pub async fn file(&self, file_id: i64) -> Result<Option<MediaFileRecord>> {
        Ok(self.store.get_file(file_id).await.map_err(Error::Database)?)
    }

    pub async fn file_by_uuid(&self, uuid: Uuid) -> Result<Option<MediaFileRecord>> {
        Ok(self
            .store
            .get_file_by_uuid(uuid)
            .await
            .map_err(Error::Database)?)
    }

    /// Snapshot of everything detection considers wrong right now.
    pub async fn detection_report(&self) -> Result<DetectionReport> {
        Ok(self
            .engine
            .detector()
            .report()
            .await
            .map_err(Error::Database)?)
    }

    /// Direct access to the recovery engine, for operator tooling.
    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Graceful shutdown: stop accepting queue work, finish in-flight
    /// attempts, stop the sweeper.
    pub async fn shutdown(self) {
        info!("Orchestrator shutting down");
        let _ = self.shutdown.send(true);
        drop(self.coordinator);
        self.pool.join().await;
        if let Err(e) = self.sweeper.await {
            error!(error = %e, "Sweeper task panicked");
        }
        info!("Orchestrator stopped");
    }
}
