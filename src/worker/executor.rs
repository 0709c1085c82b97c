//! The executor seam: the orchestrator drives lifecycle, an executor does
//! the actual media work and streams events back.

use futures::stream::BoxStream;

use crate::jobs::claim::ClaimedTask;

/// One event from a running executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Forward progress. `step` names the pipeline stage for the UI.
    Progress {
        /// Percent complete in [0, 100].
        progress: f64,
        step: Option<String>,
    },
    /// The attempt finished successfully. Must be the final event.
    Completed,
    /// The attempt failed. Must be the final event. `retriable` says whether
    /// another attempt could plausibly succeed (transient infrastructure
    /// trouble) or not (bad input, unsupported codec).
    Failed { reason: String, retriable: bool },
}

/// Executes one processing attempt for a claimed task.
///
/// Implementations wrap the real transcription/summarization machinery.
/// Event gaps between `Progress` items double as the liveness signal, so an
/// executor should report at least every `max_report_interval` even when a
/// stage is slow. A stream that ends without `Completed` or `Failed` is
/// treated as a retriable failure.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &ClaimedTask) -> BoxStream<'static, ExecutionEvent>;
}
