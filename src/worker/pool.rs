//! The worker pool: N tokio tasks pulling claimed work off the shared queue
//! and driving an executor through each attempt.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chrono::Utc;

use crate::jobs::cancel::CancellationCheckpoint;
use crate::jobs::claim::ClaimedTask;
use crate::notify::ProgressPublisher;
use crate::store::JobStore;
use crate::worker::executor::{ExecutionEvent, TaskExecutor};

/// A fixed-size pool of worker loops sharing one receiver.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers. They run until the queue sender side closes
    /// or the shutdown signal fires; an attempt already in flight is
    /// finished before the worker stops.
    pub fn spawn(
        count: usize,
        queue: mpsc::Receiver<ClaimedTask>,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn TaskExecutor>,
        publisher: Arc<ProgressPublisher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(queue));
        let handles = (0..count)
            .map(|worker_id| {
                let queue = queue.clone();
                let store = store.clone();
                let executor = executor.clone();
                let publisher = publisher.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(worker_id, "Worker started");
                    loop {
                        let claim = {
                            let mut rx = queue.lock().await;
                            tokio::select! {
                                _ = shutdown.changed() => None,
                                claim = rx.recv() => claim,
                            }
                        };
                        let Some(claim) = claim else {
                            debug!(worker_id, "Worker stopping");
                            break;
                        };
                        run_attempt(&store, executor.as_ref(), &publisher, &claim).await;
                    }
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for all workers to finish (after the queue sender is dropped).
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}

/// Drive one attempt from claim to settlement.
async fn run_attempt(
    store: &Arc<dyn JobStore>,
    executor: &dyn TaskExecutor,
    publisher: &ProgressPublisher,
    claim: &ClaimedTask,
) {
    // A task recovery already failed must not start. The transition is the
    // gate: only the worker that flips pending → running owns the attempt.
    match store.mark_task_running(claim.task_id, Utc::now()).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(task_id = %claim.task_id, "Task no longer pending, skipping");
            return;
        }
        Err(e) => {
            error!(task_id = %claim.task_id, error = %e, "Could not start task");
            return;
        }
    }

    info!(
        file_id = claim.file_id,
        task_id = %claim.task_id,
        task_type = %claim.task_type,
        retry_count = claim.retry_count,
        "Attempt started"
    );

    let checkpoint = CancellationCheckpoint::new(store.clone(), claim.file_id);
    let mut events = executor.execute(claim);
    let mut terminal_seen = false;

    while let Some(event) = events.next().await {
        // Checkpoint between steps: cancellation lands before the next
        // event is processed, never mid-step.
        match checkpoint.is_requested().await {
            Ok(true) => {
                drop(events);
                if let Err(e) = publisher.report_cancelled(claim).await {
                    error!(task_id = %claim.task_id, error = %e, "Failed to settle cancelled task");
                }
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Cancellation is best-effort; a flaky read must not kill
                // the attempt.
                warn!(task_id = %claim.task_id, error = %e, "Cancellation check failed");
            }
        }

        match event {
            ExecutionEvent::Progress { progress, step } => {
                if let Err(e) = publisher
                    .report_progress(claim, progress, step.as_deref())
                    .await
                {
                    warn!(task_id = %claim.task_id, error = %e, "Progress report failed");
                }
            }
            ExecutionEvent::Completed => {
                terminal_seen = true;
                if let Err(e) = publisher.report_completion(claim).await {
                    error!(task_id = %claim.task_id, error = %e, "Failed to settle completed task");
                }
                break;
            }
            ExecutionEvent::Failed { reason, retriable } => {
                terminal_seen = true;
                warn!(
                    file_id = claim.file_id,
                    task_id = %claim.task_id,
                    retriable,
                    error = %reason,
                    "Attempt failed"
                );
                if let Err(e) = publisher.report_failure(claim, &reason, retriable).await {
                    error!(task_id = %claim.task_id, error = %e, "Failed to settle failed task");
                }
                break;
            }
        }
    }

    if !terminal_seen {
        warn!(task_id = %claim.task_id, "Executor stream ended without a terminal event");
        if let Err(e) = publisher
            .report_failure(claim, "executor ended without a terminal event", true)
            .await
        {
            error!(task_id = %claim.task_id, error = %e, "Failed to settle abandoned task");
        }
    }
}
