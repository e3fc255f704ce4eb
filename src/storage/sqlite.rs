//! SQLite implementation of TaskStore
//!
//! Ideal for:
//! - Local development
//! - Single-node deployments
//! - Testing

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{DatabaseError, Result, SchedulerError};
use crate::models::{
    ClaimRequest, ExecutionOutcome, ExecutionStatus, TaskDescriptor, TaskExecutionInfo,
    TaskPriority,
};
use crate::storage::TaskStore;

/// SQLite-backed task store
///
/// Uses SQLite-specific features:
/// - WAL mode for better concurrency
/// - Partial unique index guarding running executions
/// - `INSERT OR IGNORE ... RETURNING` for single-statement claims (SQLite 3.35+)
///
/// Timestamps are stored as fixed-width RFC 3339 text so they compare
/// correctly as strings.
///
/// # Example
///
/// ```ignore
/// // File-based for persistence
/// let store = SqliteStore::connect("sqlite://cadence.db").await?;
///
/// // In-memory for testing
/// let store = SqliteStore::in_memory().await?;
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to SQLite database
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with single writer
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create in-memory store (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Create from existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    // =========================================================================
    // Descriptor Operations
    // =========================================================================

    async fn get_all_tasks(&self, include_disabled: bool) -> Result<Vec<TaskDescriptor>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, type_name, cron_expression, enabled, priority,
                   run_per_machine, stop_on_error, next_run_utc
            FROM scheduled_tasks
            WHERE ? OR enabled = 1
            ORDER BY id
            "#,
        )
        .bind(include_disabled)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskDescriptor>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, type_name, cron_expression, enabled, priority,
                   run_per_machine, stop_on_error, next_run_utc
            FROM scheduled_tasks WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_task_by_type(&self, type_name: &str) -> Result<Option<TaskDescriptor>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, type_name, cron_expression, enabled, priority,
                   run_per_machine, stop_on_error, next_run_utc
            FROM scheduled_tasks WHERE type_name = ?
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(type_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn insert_task(&self, task: &TaskDescriptor) -> Result<TaskDescriptor> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scheduled_tasks (
                name, type_name, cron_expression, enabled, priority,
                run_per_machine, stop_on_error, next_run_utc
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&task.name)
        .bind(&task.type_name)
        .bind(&task.cron_expression)
        .bind(task.enabled)
        .bind(task.priority.as_str())
        .bind(task.run_per_machine)
        .bind(task.stop_on_error)
        .bind(task.next_run_utc.map(format_datetime))
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskDescriptor {
            id,
            ..task.clone()
        })
    }

    async fn update_task(&self, task: &TaskDescriptor) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET name = ?, type_name = ?, cron_expression = ?, enabled = ?, priority = ?,
                run_per_machine = ?, stop_on_error = ?, next_run_utc = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.name)
        .bind(&task.type_name)
        .bind(&task.cron_expression)
        .bind(task.enabled)
        .bind(task.priority.as_str())
        .bind(task.run_per_machine)
        .bind(task.stop_on_error)
        .bind(task.next_run_utc.map(format_datetime))
        .bind(task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id: task.id });
        }
        Ok(())
    }

    async fn delete_task(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET enabled = ?1,
                next_run_utc = CASE WHEN ?1 THEN next_run_utc ELSE NULL END
            WHERE id = ?2
            "#,
        )
        .bind(enabled)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn set_next_run(&self, id: i64, next_run_utc: Option<DateTime<Utc>>) -> Result<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET next_run_utc = ? WHERE id = ?")
            .bind(next_run_utc.map(format_datetime))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        Ok(())
    }

    // =========================================================================
    // Execution Lifecycle
    // =========================================================================

    async fn try_claim(&self, request: &ClaimRequest<'_>) -> Result<Option<TaskExecutionInfo>> {
        // The NOT EXISTS guard and the insert are one statement; the partial
        // unique index rejects anything that slips past the guard.
        let row = sqlx::query(
            r#"
            INSERT OR IGNORE INTO task_executions (
                task_id, machine_name, claim_key, status, is_running, started_on_utc
            )
            SELECT ?1, ?2, ?3, 'claimed', 1, ?4
            WHERE EXISTS (SELECT 1 FROM scheduled_tasks WHERE id = ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM task_executions
                  WHERE task_id = ?1 AND claim_key = ?3
                    AND (is_running = 1 OR (?5 IS NOT NULL AND started_on_utc >= ?5))
              )
            RETURNING id, task_id, machine_name, status, started_on_utc, finished_on_utc,
                      succeeded_on_utc, error, progress_percent, progress_message
            "#,
        )
        .bind(request.task_id)
        .bind(request.machine_name)
        .bind(request.scope.key())
        .bind(format_datetime(request.claimed_at))
        .bind(request.due_slot.map(format_datetime))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn start_run(&self, execution_id: i64, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'running', started_on_utc = ?
            WHERE id = ? AND status = 'claimed'
            "#,
        )
        .bind(format_datetime(started_at))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(
        &self,
        execution_id: i64,
        percent: Option<i32>,
        message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET progress_percent = ?, progress_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(percent)
        .bind(message)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_run(
        &self,
        execution_id: i64,
        outcome: &ExecutionOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let finished = format_datetime(finished_at);
        let succeeded = matches!(outcome, ExecutionOutcome::Succeeded).then(|| finished.clone());

        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = ?, is_running = 0, finished_on_utc = ?,
                succeeded_on_utc = ?, error = ?
            WHERE id = ? AND is_running = 1
            "#,
        )
        .bind(outcome.status().as_str())
        .bind(&finished)
        .bind(succeeded)
        .bind(outcome.error())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Execution History
    // =========================================================================

    async fn get_execution(&self, id: i64) -> Result<Option<TaskExecutionInfo>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, machine_name, status, started_on_utc, finished_on_utc,
                   succeeded_on_utc, error, progress_percent, progress_message
            FROM task_executions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn get_last_execution(
        &self,
        task_id: i64,
        machine_name: Option<&str>,
    ) -> Result<Option<TaskExecutionInfo>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, machine_name, status, started_on_utc, finished_on_utc,
                   succeeded_on_utc, error, progress_percent, progress_message
            FROM task_executions
            WHERE task_id = ?1 AND (?2 IS NULL OR machine_name = ?2)
            ORDER BY started_on_utc DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .bind(machine_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    async fn get_running_executions(
        &self,
        machine_name: Option<&str>,
    ) -> Result<Vec<TaskExecutionInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, machine_name, status, started_on_utc, finished_on_utc,
                   succeeded_on_utc, error, progress_percent, progress_message
            FROM task_executions
            WHERE is_running = 1 AND (?1 IS NULL OR machine_name = ?1)
            ORDER BY id
            "#,
        )
        .bind(machine_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn get_execution_history(
        &self,
        task_id: i64,
        limit: i64,
    ) -> Result<Vec<TaskExecutionInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, machine_name, status, started_on_utc, finished_on_utc,
                   succeeded_on_utc, error, progress_percent, progress_message
            FROM task_executions
            WHERE task_id = ?
            ORDER BY started_on_utc DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    async fn abandon_machine_runs(
        &self,
        machine_name: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'failed', is_running = 0, finished_on_utc = ?, error = ?
            WHERE is_running = 1 AND machine_name = ?
            "#,
        )
        .bind(format_datetime(at))
        .bind(reason)
        .bind(machine_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn abandon_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'failed', is_running = 0, finished_on_utc = ?, error = ?
            WHERE is_running = 1 AND started_on_utc < ?
            "#,
        )
        .bind(format_datetime(at))
        .bind(reason)
        .bind(format_datetime(started_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn trim_history(&self, keep: i64, older_than: Option<DateTime<Utc>>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM task_executions WHERE id IN (
                SELECT id FROM (
                    SELECT id, is_running, started_on_utc,
                           ROW_NUMBER() OVER (
                               PARTITION BY task_id, claim_key
                               ORDER BY started_on_utc DESC, id DESC
                           ) AS rn
                    FROM task_executions
                ) ranked
                WHERE is_running = 0
                  AND (rn > ?1 OR (?2 IS NOT NULL AND started_on_utc < ?2))
            )
            "#,
        )
        .bind(keep)
        .bind(older_than.map(format_datetime))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| SchedulerError::Database(DatabaseError::Migration(e.to_string())))?;
        Ok(())
    }
}

// =============================================================================
// Row Helpers
// =============================================================================

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<TaskDescriptor> {
    let priority: String = row.try_get("priority")?;
    let next_run_utc: Option<String> = row.try_get("next_run_utc")?;

    Ok(TaskDescriptor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        type_name: row.try_get("type_name")?,
        cron_expression: row.try_get("cron_expression")?,
        enabled: row.try_get("enabled")?,
        priority: TaskPriority::parse(&priority)
            .ok_or_else(|| decode_error(format!("unknown priority '{priority}'")))?,
        run_per_machine: row.try_get("run_per_machine")?,
        stop_on_error: row.try_get("stop_on_error")?,
        next_run_utc: next_run_utc.as_deref().map(parse_datetime).transpose()?,
    })
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<TaskExecutionInfo> {
    let status: String = row.try_get("status")?;
    let started_on_utc: String = row.try_get("started_on_utc")?;
    let finished_on_utc: Option<String> = row.try_get("finished_on_utc")?;
    let succeeded_on_utc: Option<String> = row.try_get("succeeded_on_utc")?;

    Ok(TaskExecutionInfo {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        machine_name: row.try_get("machine_name")?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| decode_error(format!("unknown execution status '{status}'")))?,
        started_on_utc: parse_datetime(&started_on_utc)?,
        finished_on_utc: finished_on_utc.as_deref().map(parse_datetime).transpose()?,
        succeeded_on_utc: succeeded_on_utc.as_deref().map(parse_datetime).transpose()?,
        error: row.try_get("error")?,
        progress_percent: row.try_get("progress_percent")?,
        progress_message: row.try_get("progress_message")?,
    })
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| decode_error(format!("invalid timestamp '{s}': {e}")))
}

fn decode_error(message: String) -> SchedulerError {
    SchedulerError::Database(DatabaseError::Decode(message))
}
