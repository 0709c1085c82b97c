//! libSQL backend — async `JobStore` implementation.
//!
//! All invariant-bearing writes are single conditional UPDATE statements;
//! the returned row count is the compare-and-swap result. Supports local
//! file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{FileStatus, MediaFileRecord, NewMediaFile, TaskRecord, TaskStatus, TaskType};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// libSQL job store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const FILE_COLUMNS: &str = "id, uuid, user_id, filename, status, active_task_id, \
     task_started_at, task_last_update, cancellation_requested, retry_count, max_retries, \
     last_error_message, force_delete_eligible, recovery_attempts, last_recovery_attempt, \
     created_at, updated_at";

const TASK_COLUMNS: &str = "id, user_id, media_file_id, task_type, status, progress, \
     created_at, updated_at, completed_at, error_message";

/// Map a libsql Row to a MediaFileRecord, starting at column `base`.
///
/// Column order matches FILE_COLUMNS.
fn row_to_file(row: &libsql::Row, base: i32) -> Result<MediaFileRecord, libsql::Error> {
    let uuid_str: String = row.get(base + 1)?;
    let status_str: String = row.get(base + 4)?;
    let active_task_str: Option<String> = row.get::<String>(base + 5).ok();
    let started_str: Option<String> = row.get::<String>(base + 6).ok();
    let last_update_str: Option<String> = row.get::<String>(base + 7).ok();
    let last_error: Option<String> = row.get::<String>(base + 11).ok();
    let last_recovery_str: Option<String> = row.get::<String>(base + 14).ok();
    let created_str: String = row.get(base + 15)?;
    let updated_str: String = row.get(base + 16)?;

    Ok(MediaFileRecord {
        id: row.get(base)?,
        uuid: Uuid::parse_str(&uuid_str).unwrap_or_else(|_| Uuid::nil()),
        user_id: row.get(base + 2)?,
        filename: row.get(base + 3)?,
        status: FileStatus::parse(&status_str),
        active_task_id: active_task_str.and_then(|s| Uuid::parse_str(&s).ok()),
        task_started_at: parse_optional_datetime(&started_str),
        task_last_update: parse_optional_datetime(&last_update_str),
        cancellation_requested: row.get::<i64>(base + 8)? != 0,
        retry_count: row.get::<i64>(base + 9)? as u32,
        max_retries: row.get::<i64>(base + 10)? as u32,
        last_error_message: last_error,
        force_delete_eligible: row.get::<i64>(base + 12)? != 0,
        recovery_attempts: row.get::<i64>(base + 13)? as u32,
        last_recovery_attempt: parse_optional_datetime(&last_recovery_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a TaskRecord, starting at column `base`.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row, base: i32) -> Result<TaskRecord, libsql::Error> {
    let id_str: String = row.get(base)?;
    let type_str: String = row.get(base + 3)?;
    let status_str: String = row.get(base + 4)?;
    let created_str: String = row.get(base + 6)?;
    let updated_str: String = row.get(base + 7)?;
    let completed_str: Option<String> = row.get::<String>(base + 8).ok();
    let error: Option<String> = row.get::<String>(base + 9).ok();

    Ok(TaskRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        user_id: row.get(base + 1)?,
        media_file_id: row.get(base + 2)?,
        task_type: TaskType::parse(&type_str),
        status: TaskStatus::parse(&status_str),
        progress: row.get(base + 5)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(&completed_str),
        error_message: error,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(self.conn()).await
    }

    // ── Files ───────────────────────────────────────────────────────

    async fn insert_file(&self, file: &NewMediaFile) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO media_files (uuid, user_id, filename, status, max_retries, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
            params![
                file.uuid.to_string(),
                file.user_id.clone(),
                file.filename.clone(),
                file.max_retries as i64,
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_file: {e}")))?;

        let id = conn.last_insert_rowid();
        debug!(file_id = id, uuid = %file.uuid, "Media file registered");
        Ok(id)
    }

    async fn get_file(&self, file_id: i64) -> Result<Option<MediaFileRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FILE_COLUMNS} FROM media_files WHERE id = ?1"),
                params![file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_file: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let file = row_to_file(&row, 0)
                    .map_err(|e| DatabaseError::Query(format!("get_file row parse: {e}")))?;
                Ok(Some(file))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_file: {e}"))),
        }
    }

    async fn get_file_by_uuid(
        &self,
        uuid: Uuid,
    ) -> Result<Option<MediaFileRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FILE_COLUMNS} FROM media_files WHERE uuid = ?1"),
                params![uuid.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_file_by_uuid: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let file = row_to_file(&row, 0).map_err(|e| {
                    DatabaseError::Query(format!("get_file_by_uuid row parse: {e}"))
                })?;
                Ok(Some(file))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_file_by_uuid: {e}"))),
        }
    }

    async fn list_files_with_status(
        &self,
        statuses: &[FileStatus],
        user_id: Option<&str>,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut values: Vec<libsql::Value> = statuses
            .iter()
            .map(|s| libsql::Value::Text(s.as_str().to_string()))
            .collect();
        let placeholders: Vec<String> =
            (1..=statuses.len()).map(|i| format!("?{i}")).collect();
        let mut sql = format!(
            "SELECT {FILE_COLUMNS} FROM media_files WHERE status IN ({})",
            placeholders.join(", ")
        );
        if let Some(user) = user_id {
            sql.push_str(&format!(" AND user_id = ?{}", values.len() + 1));
            values.push(libsql::Value::Text(user.to_string()));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut rows = self
            .conn()
            .query(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("list_files_with_status: {e}")))?;

        let mut files = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_file(&row, 0) {
                Ok(file) => files.push(file),
                Err(e) => tracing::warn!("Skipping media file row: {e}"),
            }
        }
        Ok(files)
    }

    async fn list_user_ids(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT user_id FROM media_files ORDER BY user_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_user_ids: {e}")))?;

        let mut users = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(user) = row.get::<String>(0) {
                users.push(user);
            }
        }
        Ok(users)
    }

    // ── Claiming ────────────────────────────────────────────────────

    async fn claim_file(
        &self,
        task: &TaskRecord,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        // Pointer install and task insert commit together, so there is no
        // instant at which either a second live task or a pointer at a
        // missing row can be observed.
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_file begin: {e}")))?;

        let changed = tx
            .execute(
                "UPDATE media_files SET status = 'processing', active_task_id = ?1, \
                 task_started_at = ?2, task_last_update = ?2, cancellation_requested = 0, \
                 retry_count = ?3, updated_at = ?2 \
                 WHERE id = ?4 AND active_task_id IS NULL",
                params![
                    task.id.to_string(),
                    now.to_rfc3339(),
                    retry_count as i64,
                    task.media_file_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_file: {e}")))?;

        if changed == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_file rollback: {e}")))?;
            debug!(file_id = task.media_file_id, task_id = %task.id, won = false, "Claim attempt");
            return Ok(false);
        }

        tx.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                task.id.to_string(),
                task.user_id.clone(),
                task.media_file_id,
                task.task_type.as_str(),
                task.status.as_str(),
                task.progress,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                opt_text(task.completed_at.map(|t| t.to_rfc3339()).as_deref()),
                opt_text(task.error_message.as_deref()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_file insert: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_file commit: {e}")))?;

        debug!(file_id = task.media_file_id, task_id = %task.id, won = true, "Claim attempt");
        Ok(true)
    }

    async fn release_drifted_pointer(&self, file_id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE media_files SET active_task_id = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND active_task_id IS NOT NULL AND NOT EXISTS ( \
                     SELECT 1 FROM tasks t WHERE t.id = media_files.active_task_id \
                     AND t.status IN ('pending', 'running'))",
                params![Utc::now().to_rfc3339(), file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_drifted_pointer: {e}")))?;

        if changed > 0 {
            debug!(file_id, "Cleared drifted active task pointer");
        }
        Ok(changed > 0)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    task.id.to_string(),
                    task.user_id.clone(),
                    task.media_file_id,
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.progress,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                    opt_text(task.completed_at.map(|t| t.to_rfc3339()).as_deref()),
                    opt_text(task.error_message.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, file_id = task.media_file_id, task_type = %task.task_type, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row, 0)
                    .map_err(|e| DatabaseError::Query(format!("get_task row parse: {e}")))?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn latest_task_for_file(
        &self,
        file_id: i64,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE media_file_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_task_for_file: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row, 0).map_err(|e| {
                    DatabaseError::Query(format!("latest_task_for_file row parse: {e}"))
                })?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_task_for_file: {e}"))),
        }
    }

    async fn count_live_tasks(&self, file_id: i64) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE media_file_id = ?1 \
                 AND status IN ('pending', 'running')",
                params![file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_live_tasks: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("count_live_tasks parse: {e}")))?
                as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_live_tasks: {e}"))),
        }
    }

    async fn mark_task_running(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'running', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![now.to_rfc3339(), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_task_running: {e}")))?;
        Ok(changed > 0)
    }

    async fn update_task_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        // MAX keeps stored progress monotonic even under redelivery.
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET progress = MAX(progress, ?1), updated_at = ?2 \
                 WHERE id = ?3 AND status = 'running'",
                params![progress.clamp(0.0, 100.0), now.to_rfc3339(), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_progress: {e}")))?;
        Ok(changed > 0)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', progress = 100, updated_at = ?1, \
                 completed_at = ?1 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![now.to_rfc3339(), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', error_message = ?1, updated_at = ?2, \
                 completed_at = ?2 WHERE id = ?3 AND status IN ('pending', 'running')",
                params![error, now.to_rfc3339(), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;
        Ok(changed > 0)
    }

    // ── File terminal updates & liveness ────────────────────────────

    async fn touch_liveness(
        &self,
        file_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE media_files SET task_last_update = ?1, updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_liveness: {e}")))?;
        Ok(())
    }

    async fn finish_file(
        &self,
        file_id: i64,
        task_id: Uuid,
        status: FileStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE media_files SET status = ?1, last_error_message = ?2, \
                 active_task_id = NULL, updated_at = ?3 \
                 WHERE id = ?4 AND active_task_id = ?5",
                params![
                    status.as_str(),
                    opt_text(error),
                    now.to_rfc3339(),
                    file_id,
                    task_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_file: {e}")))?;

        debug!(file_id, task_id = %task_id, status = %status, settled = changed > 0, "File settle attempt");
        Ok(changed > 0)
    }

    async fn repair_file_status(
        &self,
        file_id: i64,
        expected: FileStatus,
        status: FileStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE media_files SET status = ?1, \
                 last_error_message = COALESCE(?2, last_error_message), \
                 active_task_id = NULL, updated_at = ?3 \
                 WHERE id = ?4 AND status = ?5",
                params![
                    status.as_str(),
                    opt_text(error),
                    now.to_rfc3339(),
                    file_id,
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("repair_file_status: {e}")))?;
        Ok(changed > 0)
    }

    async fn repair_attach_live_task(
        &self,
        file_id: i64,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE media_files SET status = 'processing', active_task_id = ?1, \
                 task_last_update = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status != 'processing' \
                 AND (active_task_id IS NULL OR active_task_id = ?1)",
                params![task_id.to_string(), now.to_rfc3339(), file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("repair_attach_live_task: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_retries_exhausted(&self, file_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE media_files SET force_delete_eligible = 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_retries_exhausted: {e}")))?;
        Ok(())
    }

    async fn delete_file(&self, file_id: i64) -> Result<bool, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_file begin: {e}")))?;

        // The guard and the delete are one statement: a live task blocks
        // deletion unless the file was marked force-delete eligible.
        let changed = tx
            .execute(
                "DELETE FROM media_files WHERE id = ?1 AND (force_delete_eligible = 1 \
                 OR NOT EXISTS (SELECT 1 FROM tasks t WHERE t.media_file_id = media_files.id \
                 AND t.status IN ('pending', 'running')))",
                params![file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_file: {e}")))?;

        if changed == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_file rollback: {e}")))?;
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM tasks WHERE media_file_id = ?1",
            params![file_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_file tasks: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_file commit: {e}")))?;

        debug!(file_id, "Media file deleted");
        Ok(true)
    }

    // ── Cancellation ────────────────────────────────────────────────

    async fn request_cancellation(&self, file_id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE media_files SET cancellation_requested = 1, updated_at = ?1 \
                 WHERE id = ?2 AND active_task_id IS NOT NULL",
                params![Utc::now().to_rfc3339(), file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("request_cancellation: {e}")))?;
        Ok(changed > 0)
    }

    async fn cancellation_requested(&self, file_id: i64) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT cancellation_requested FROM media_files WHERE id = ?1",
                params![file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancellation_requested: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("cancellation_requested parse: {e}")))?
                != 0),
            // The file is gone (force delete); the worker should stop.
            Ok(None) => Ok(true),
            Err(e) => Err(DatabaseError::Query(format!("cancellation_requested: {e}"))),
        }
    }

    // ── Detection queries ───────────────────────────────────────────

    async fn list_stale_live_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(MediaFileRecord, TaskRecord)>, DatabaseError> {
        let file_cols = qualify(FILE_COLUMNS, "f");
        let task_cols = qualify(TASK_COLUMNS, "t");
        // Liveness falls back to task_started_at / created_at the way the
        // claim path fills them, so a never-updated claim still goes stale.
        let sql = format!(
            "SELECT {file_cols}, {task_cols} FROM tasks t \
             JOIN media_files f ON f.id = t.media_file_id \
             WHERE t.status IN ('pending', 'running') \
             AND COALESCE(f.task_last_update, f.task_started_at, f.created_at) < ?1 \
             ORDER BY t.created_at ASC"
        );

        let mut rows = self
            .conn()
            .query(&sql, params![cutoff.to_rfc3339()])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_stale_live_tasks: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let parsed = row_to_file(&row, 0).and_then(|f| Ok((f, row_to_task(&row, 17)?)));
            match parsed {
                Ok(pair) => out.push(pair),
                Err(e) => tracing::warn!("Skipping stale task row: {e}"),
            }
        }
        Ok(out)
    }

    async fn list_live_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status IN ('pending', 'running') ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_live_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row, 0) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn list_processing_without_live_task(
        &self,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError> {
        self.query_files(&format!(
            "SELECT {FILE_COLUMNS} FROM media_files f WHERE f.status = 'processing' \
             AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.media_file_id = f.id \
             AND t.status IN ('pending', 'running'))"
        ))
        .await
    }

    async fn list_files_with_drifted_pointer(
        &self,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError> {
        self.query_files(&format!(
            "SELECT {FILE_COLUMNS} FROM media_files f WHERE f.active_task_id IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.id = f.active_task_id \
             AND t.status IN ('pending', 'running'))"
        ))
        .await
    }

    async fn list_nonprocessing_with_live_task(
        &self,
    ) -> Result<Vec<MediaFileRecord>, DatabaseError> {
        self.query_files(&format!(
            "SELECT {FILE_COLUMNS} FROM media_files f WHERE f.status != 'processing' \
             AND EXISTS (SELECT 1 FROM tasks t WHERE t.media_file_id = f.id \
             AND t.status IN ('pending', 'running'))"
        ))
        .await
    }

    // ── Recovery bookkeeping ────────────────────────────────────────

    async fn record_recovery_attempt(
        &self,
        file_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE media_files SET recovery_attempts = recovery_attempts + 1, \
                 last_recovery_attempt = ?1, updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), file_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_recovery_attempt: {e}")))?;
        Ok(())
    }
}

impl LibSqlJobStore {
    async fn query_files(&self, sql: &str) -> Result<Vec<MediaFileRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("query_files: {e}")))?;

        let mut files = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_file(&row, 0) {
                Ok(file) => files.push(file),
                Err(e) => tracing::warn!("Skipping media file row: {e}"),
            }
        }
        Ok(files)
    }
}

/// Prefix every column in a column list with a table alias.
fn qualify(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::NewMediaFile;

    async fn store() -> LibSqlJobStore {
        LibSqlJobStore::new_memory().await.unwrap()
    }

    fn new_task(file_id: i64, user: &str) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            media_file_id: file_id,
            task_type: TaskType::Transcription,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_file() {
        let store = store().await;
        let new = NewMediaFile::new("alice", "meeting.mp4", 3);
        let id = store.insert_file(&new).await.unwrap();

        let file = store.get_file(id).await.unwrap().unwrap();
        assert_eq!(file.uuid, new.uuid);
        assert_eq!(file.status, FileStatus::Pending);
        assert_eq!(file.max_retries, 3);
        assert!(file.active_task_id.is_none());
        assert!(!file.cancellation_requested);

        let by_uuid = store.get_file_by_uuid(new.uuid).await.unwrap().unwrap();
        assert_eq!(by_uuid.id, id);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();

        let first = new_task(id, "alice");
        let second = new_task(id, "alice");
        let now = Utc::now();
        assert!(store.claim_file(&first, 0, now).await.unwrap());
        assert!(!store.claim_file(&second, 0, now).await.unwrap());

        let file = store.get_file(id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Processing);
        assert_eq!(file.active_task_id, Some(first.id));

        // The losing claim rolled back whole: no second task row, live or
        // terminal, and the live count never exceeds one.
        assert_eq!(store.count_live_tasks(id).await.unwrap(), 1);
        assert!(store.get_task(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_clears_cancellation_flag() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let now = Utc::now();
        let task = new_task(id, "alice");
        assert!(store.claim_file(&task, 0, now).await.unwrap());
        assert!(store.request_cancellation(id).await.unwrap());
        assert!(store.cancellation_requested(id).await.unwrap());

        // Settle and reclaim; the flag must be reset.
        store.fail_task(task.id, "boom", now).await.unwrap();
        assert!(store
            .finish_file(id, task.id, FileStatus::Failed, Some("boom"), now)
            .await
            .unwrap());
        assert!(store.claim_file(&new_task(id, "alice"), 1, now).await.unwrap());
        assert!(!store.cancellation_requested(id).await.unwrap());
    }

    #[tokio::test]
    async fn cancellation_noop_without_active_task() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        assert!(!store.request_cancellation(id).await.unwrap());
        assert!(!store.cancellation_requested(id).await.unwrap());
    }

    #[tokio::test]
    async fn task_status_cas_is_one_directional() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let task = new_task(id, "alice");
        store.insert_task(&task).await.unwrap();

        let now = Utc::now();
        assert!(store.mark_task_running(task.id, now).await.unwrap());
        assert!(!store.mark_task_running(task.id, now).await.unwrap());
        assert!(store.complete_task(task.id, now).await.unwrap());
        // Terminal states are immutable.
        assert!(!store.fail_task(task.id, "late", now).await.unwrap());
        assert!(!store.complete_task(task.id, now).await.unwrap());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.progress, 100.0);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let task = new_task(id, "alice");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now();
        store.mark_task_running(task.id, now).await.unwrap();

        assert!(store.update_task_progress(task.id, 40.0, now).await.unwrap());
        assert!(store.update_task_progress(task.id, 10.0, now).await.unwrap());
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 40.0);
    }

    #[tokio::test]
    async fn finish_file_requires_matching_pointer() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let now = Utc::now();
        let task = new_task(id, "alice");
        store.claim_file(&task, 0, now).await.unwrap();

        // A stranger task id cannot settle the file.
        assert!(!store
            .finish_file(id, Uuid::new_v4(), FileStatus::Completed, None, now)
            .await
            .unwrap());
        assert!(store
            .finish_file(id, task.id, FileStatus::Completed, None, now)
            .await
            .unwrap());
        // Second settle is a no-op: pointer already cleared.
        assert!(!store
            .finish_file(id, task.id, FileStatus::Failed, Some("late"), now)
            .await
            .unwrap());

        let file = store.get_file(id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Completed);
        assert!(file.active_task_id.is_none());
    }

    #[tokio::test]
    async fn release_drifted_pointer_spares_live_tasks() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let now = Utc::now();
        let task = new_task(id, "alice");
        store.claim_file(&task, 0, now).await.unwrap();

        // Live task: pointer must survive.
        assert!(!store.release_drifted_pointer(id).await.unwrap());

        // Terminal task: pointer is drift and gets cleared.
        store.fail_task(task.id, "died", now).await.unwrap();
        assert!(store.release_drifted_pointer(id).await.unwrap());
        let file = store.get_file(id).await.unwrap().unwrap();
        assert!(file.active_task_id.is_none());
    }

    #[tokio::test]
    async fn stale_detection_uses_liveness_cutoff() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let task = new_task(id, "alice");
        store.claim_file(&task, 0, long_ago).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let stale = store.list_stale_live_tasks(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0.id, id);
        assert_eq!(stale[0].1.id, task.id);

        // A fresh liveness touch takes it out of the stale set.
        store.touch_liveness(id, Utc::now()).await.unwrap();
        let stale = store.list_stale_live_tasks(cutoff).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn inconsistency_queries() {
        let store = store().await;
        let now = Utc::now();

        // processing file whose only task already terminated, pointer cleared
        let orphan = store
            .insert_file(&NewMediaFile::new("alice", "orphan.mp4", 3))
            .await
            .unwrap();
        let dead = new_task(orphan, "alice");
        store.claim_file(&dead, 0, now).await.unwrap();
        store.fail_task(dead.id, "died", now).await.unwrap();
        store.release_drifted_pointer(orphan).await.unwrap();

        let listed = store.list_processing_without_live_task().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, orphan);

        // pointer at a terminal task
        let drifted = store
            .insert_file(&NewMediaFile::new("alice", "drift.mp4", 3))
            .await
            .unwrap();
        let task = new_task(drifted, "alice");
        store.claim_file(&task, 0, now).await.unwrap();
        store.fail_task(task.id, "died", now).await.unwrap();

        let listed = store.list_files_with_drifted_pointer().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, drifted);

        // live task under a non-processing file
        let reversed = store
            .insert_file(&NewMediaFile::new("alice", "reversed.mp4", 3))
            .await
            .unwrap();
        let live = new_task(reversed, "alice");
        store.insert_task(&live).await.unwrap();

        let listed = store.list_nonprocessing_with_live_task().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, reversed);

        assert!(store
            .repair_attach_live_task(reversed, live.id, now)
            .await
            .unwrap());
        let file = store.get_file(reversed).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Processing);
        assert_eq!(file.active_task_id, Some(live.id));
    }

    #[tokio::test]
    async fn delete_refused_while_task_is_live() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let task = new_task(id, "alice");
        store.claim_file(&task, 0, Utc::now()).await.unwrap();

        assert!(!store.delete_file(id).await.unwrap());
        assert!(store.get_file(id).await.unwrap().is_some());

        // Settled files delete along with their task history.
        let now = Utc::now();
        store.complete_task(task.id, now).await.unwrap();
        store
            .finish_file(id, task.id, FileStatus::Completed, None, now)
            .await
            .unwrap();
        assert!(store.delete_file(id).await.unwrap());
        assert!(store.get_file(id).await.unwrap().is_none());
        assert!(store.get_task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_delete_overrides_live_task_and_reads_cancelled() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let task = new_task(id, "alice");
        store.claim_file(&task, 0, Utc::now()).await.unwrap();
        store.mark_retries_exhausted(id).await.unwrap();

        assert!(store.delete_file(id).await.unwrap());
        assert!(store.get_file(id).await.unwrap().is_none());
        assert!(store.get_task(task.id).await.unwrap().is_none());

        // The orphaned worker polls the flag and sees a stop signal.
        assert!(store.cancellation_requested(id).await.unwrap());
    }

    #[tokio::test]
    async fn recovery_bookkeeping() {
        let store = store().await;
        let id = store
            .insert_file(&NewMediaFile::new("alice", "a.mp4", 3))
            .await
            .unwrap();
        let now = Utc::now();
        store.record_recovery_attempt(id, now).await.unwrap();
        store.record_recovery_attempt(id, now).await.unwrap();

        let file = store.get_file(id).await.unwrap().unwrap();
        assert_eq!(file.recovery_attempts, 2);
        assert!(file.last_recovery_attempt.is_some());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scribed.db");

        let uuid;
        {
            let store = LibSqlJobStore::new_local(&path).await.unwrap();
            let new = NewMediaFile::new("alice", "persist.mp4", 2);
            uuid = new.uuid;
            store.insert_file(&new).await.unwrap();
        }

        let store = LibSqlJobStore::new_local(&path).await.unwrap();
        let file = store.get_file_by_uuid(uuid).await.unwrap().unwrap();
        assert_eq!(file.filename, "persist.mp4");
        assert_eq!(file.max_retries, 2);
    }
}
