//! Cooperative cancellation.
//!
//! Cancellation is a flag, not a kill. The requester flips
//! `cancellation_requested`; workers poll it at checkpoints between pipeline
//! steps and abandon the attempt at the next one. In-flight step work is
//! never interrupted mid-stride.

use std::sync::Arc;

use tracing::info;

use crate::error::DatabaseError;
use crate::store::JobStore;

/// What a cancellation request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOutcome {
    /// The flag was set; the active task will stop at its next checkpoint.
    Requested,
    /// Nothing was running, so there was nothing to cancel.
    NoActiveTask,
}

/// Request cancellation of a file's active task, if it has one.
///
/// Idempotent: repeating the request while the flag is already set still
/// reports `Requested`.
pub async fn request(
    store: &dyn JobStore,
    file_id: i64,
) -> Result<CancellationOutcome, DatabaseError> {
    if store.request_cancellation(file_id).await? {
        info!(file_id, "Cancellation requested");
        Ok(CancellationOutcome::Requested)
    } else {
        Ok(CancellationOutcome::NoActiveTask)
    }
}

/// A worker-side handle for polling the cancellation flag at checkpoints.
#[derive(Clone)]
pub struct CancellationCheckpoint {
    store: Arc<dyn JobStore>,
    file_id: i64,
}

impl CancellationCheckpoint {
    pub fn new(store: Arc<dyn JobStore>, file_id: i64) -> Self {
        Self { store, file_id }
    }

    /// True if the attempt should stop before the next step.
    pub async fn is_requested(&self) -> Result<bool, DatabaseError> {
        self.store.cancellation_requested(self.file_id).await
    }
}
