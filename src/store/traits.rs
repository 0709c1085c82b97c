//! The `JobStore` trait — single async interface for all persistence.
//!
//! Every mutation that the "at most one active task per file" invariant
//! depends on is a conditional update keyed on the field's expected prior
//! value and reports whether it won. Callers must never read-then-write
//! around these primitives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{FileStatus, MediaFileRecord, NewMediaFile, TaskRecord};

/// Backend-agnostic persistence trait for media files and their tasks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Files ───────────────────────────────────────────────────────

    /// Register a new media file in `pending`. Returns the internal id.
    async fn insert_file(&self, file: &NewMediaFile) -> Result<i64, DatabaseError>;

    /// Get a file by internal id.
    async fn get_file(&self, file_id: i64) -> Result<Option<MediaFileRecord>, DatabaseError>;

    /// Get a file by its surface uuid.
    async fn get_file_by_uuid(
        &self,
        uuid: Uuid,
    ) -> Result<Option<MediaFileRecord>, DatabaseError>;

    /// List files in any of the given statuses, optionally scoped to a user.
    async fn list_files_with_status(
        &self,
        statuses: &[FileStatus],
        user_id: Option<&str>,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError>;

    /// Distinct user ids that own at least one file.
    async fn list_user_ids(&self) -> Result<Vec<String>, DatabaseError>;

    // ── Claiming ────────────────────────────────────────────────────

    /// Atomically claim a file for a new attempt. In one transaction:
    /// a conditional update keyed on `active_task_id IS NULL` sets status to
    /// `processing`, installs the pointer, stamps both liveness timestamps,
    /// writes `retry_count`, and clears `cancellation_requested`; then the
    /// task row is inserted. Returns false (and writes nothing) when another
    /// claim won the race, so no observer ever sees a second live task.
    async fn claim_file(
        &self,
        task: &TaskRecord,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Clear an `active_task_id` that no longer points at a live task
    /// (terminal or missing). Returns true if a drifted pointer was cleared.
    /// A pointer at a genuinely live task is left untouched.
    async fn release_drifted_pointer(&self, file_id: i64) -> Result<bool, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a freshly claimed task row.
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError>;

    /// Get a task by id.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    /// The most recently created task for a file, live or terminal.
    async fn latest_task_for_file(
        &self,
        file_id: i64,
    ) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Count of pending/running tasks for a file (invariant 1 says ≤ 1).
    async fn count_live_tasks(&self, file_id: i64) -> Result<u64, DatabaseError>;

    /// Transition a task `pending → running`. False if it was not pending.
    async fn mark_task_running(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Update a running task's progress. Progress never regresses; a lower
    /// value than what is stored is ignored. False if the task is not running.
    async fn update_task_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Transition a live task to `completed`. False if already terminal.
    async fn complete_task(&self, task_id: Uuid, now: DateTime<Utc>)
        -> Result<bool, DatabaseError>;

    /// Transition a live task to `failed` with an error message.
    /// False if already terminal.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── File terminal updates & liveness ────────────────────────────

    /// Refresh the owning file's `task_last_update` liveness timestamp.
    async fn touch_liveness(&self, file_id: i64, now: DateTime<Utc>)
        -> Result<(), DatabaseError>;

    /// Settle a file after its task terminated: set the terminal status,
    /// record the error message if any, and clear the pointer, but only
    /// while `active_task_id` still equals `task_id`. False means a
    /// concurrent claim or recovery got there first.
    async fn finish_file(
        &self,
        file_id: i64,
        task_id: Uuid,
        status: FileStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Reconciliation repair: move a file from `expected` status to `status`,
    /// clearing the pointer. False if the file was no longer in `expected`.
    async fn repair_file_status(
        &self,
        file_id: i64,
        expected: FileStatus,
        status: FileStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Reconciliation repair for the reverse drift: a live task exists but
    /// the file is not `processing`. Reattaches the pointer and restores
    /// `processing`, guarded against clobbering a different live pointer.
    async fn repair_attach_live_task(
        &self,
        file_id: i64,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Mark a file's retry budget as spent (`force_delete_eligible = true`).
    async fn mark_retries_exhausted(&self, file_id: i64) -> Result<(), DatabaseError>;

    /// Delete a file and its task history. Refused (false) while a live
    /// task exists and the file is not `force_delete_eligible`; a forced
    /// delete proceeds despite the live task, whose worker then observes
    /// the missing file as a cancellation at its next checkpoint.
    async fn delete_file(&self, file_id: i64) -> Result<bool, DatabaseError>;

    // ── Cancellation ────────────────────────────────────────────────

    /// Set `cancellation_requested` if the file has an active task.
    /// Returns false (no-op) when nothing is running.
    async fn request_cancellation(&self, file_id: i64) -> Result<bool, DatabaseError>;

    /// Read the cancellation flag. A file that no longer exists reads as
    /// cancelled, so workers stop after a forced delete.
    async fn cancellation_requested(&self, file_id: i64) -> Result<bool, DatabaseError>;

    // ── Detection queries ───────────────────────────────────────────

    /// Live tasks whose owning file's `task_last_update` is older than
    /// `cutoff`, joined with the file.
    async fn list_stale_live_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(MediaFileRecord, TaskRecord)>, DatabaseError>;

    /// All live tasks regardless of timestamps (startup recovery input).
    async fn list_live_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Files marked `processing` with no live task at all.
    async fn list_processing_without_live_task(
        &self,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError>;

    /// Files whose `active_task_id` references a terminal or missing task.
    async fn list_files_with_drifted_pointer(
        &self,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError>;

    /// Files not in `processing` that nonetheless own a live task.
    async fn list_nonprocessing_with_live_task(
        &self,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError>;

    // ── Recovery bookkeeping ────────────────────────────────────────

    /// Bump `recovery_attempts` and stamp `last_recovery_attempt`.
    async fn record_recovery_attempt(
        &self,
        file_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}
