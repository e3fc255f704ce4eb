//! Task Store abstraction
//!
//! Persistence of task descriptors and their execution history. The store is
//! the only shared state between web-farm nodes, so every state transition the
//! scheduler relies on for correctness is a single atomic store operation:
//! most importantly [`TaskStore::try_claim`], which must let exactly one caller
//! win per claim scope.
//!
//! Cadence ships an in-process [`MemoryStore`] (tests, single-node embedding)
//! plus SQLite and PostgreSQL backends behind cargo features.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Result;
use crate::models::{ClaimRequest, ExecutionOutcome, TaskDescriptor, TaskExecutionInfo};
use crate::scheduler::cron;

/// Core storage trait - implement this for any database backend
///
/// # Example
///
/// ```ignore
/// use cadence::storage::{SqliteStore, TaskStore};
///
/// let store = SqliteStore::connect("sqlite://cadence.db").await?;
/// store.migrate().await?;
///
/// let tasks = store.get_all_tasks(false).await?;
/// ```
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Descriptor Operations
    // =========================================================================

    /// All descriptors ordered by id, optionally including disabled ones
    async fn get_all_tasks(&self, include_disabled: bool) -> Result<Vec<TaskDescriptor>>;

    async fn get_task(&self, id: i64) -> Result<Option<TaskDescriptor>>;

    /// First descriptor (lowest id) with the given implementation type
    async fn get_task_by_type(&self, type_name: &str) -> Result<Option<TaskDescriptor>>;

    /// Insert a descriptor and return it with its assigned id
    async fn insert_task(&self, task: &TaskDescriptor) -> Result<TaskDescriptor>;

    /// Overwrite a descriptor (admin edit); `TaskNotFound` if it does not exist
    async fn update_task(&self, task: &TaskDescriptor) -> Result<()>;

    /// Remove a descriptor and its history (uninstall)
    async fn delete_task(&self, id: i64) -> Result<bool>;

    /// Set the enabled flag. Disabling also clears `next_run_utc`.
    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()>;

    async fn set_next_run(&self, id: i64, next_run_utc: Option<DateTime<Utc>>) -> Result<()>;

    // =========================================================================
    // Execution Lifecycle
    // =========================================================================

    /// Atomically claim a descriptor
    ///
    /// Creates a `Claimed` execution record and returns it, or returns `None`
    /// when the claim is lost: an execution in the same scope is still running,
    /// or (when `due_slot` is set) one already started at or after the slot.
    /// The check and the insert must be one atomic operation.
    async fn try_claim(&self, request: &ClaimRequest<'_>) -> Result<Option<TaskExecutionInfo>>;

    /// `Claimed -> Running`; returns false if the execution was not claimed
    async fn start_run(&self, execution_id: i64, started_at: DateTime<Utc>) -> Result<bool>;

    /// Persist progress; applies only while the execution is `Running`
    async fn update_progress(
        &self,
        execution_id: i64,
        percent: Option<i32>,
        message: Option<&str>,
    ) -> Result<bool>;

    /// Finalize an execution; applies only while it is not terminal yet
    async fn complete_run(
        &self,
        execution_id: i64,
        outcome: &ExecutionOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<bool>;

    // =========================================================================
    // Execution History
    // =========================================================================

    async fn get_execution(&self, id: i64) -> Result<Option<TaskExecutionInfo>>;

    /// Most recent execution of a descriptor, optionally on one machine only
    async fn get_last_execution(
        &self,
        task_id: i64,
        machine_name: Option<&str>,
    ) -> Result<Option<TaskExecutionInfo>>;

    /// Executions still holding a claim, optionally on one machine only
    async fn get_running_executions(
        &self,
        machine_name: Option<&str>,
    ) -> Result<Vec<TaskExecutionInfo>>;

    /// Newest first
    async fn get_execution_history(
        &self,
        task_id: i64,
        limit: i64,
    ) -> Result<Vec<TaskExecutionInfo>>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Fail every unfinished execution of a machine (its process restarted)
    async fn abandon_machine_runs(
        &self,
        machine_name: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Fail unfinished executions that started before `started_before`
    async fn abandon_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Delete finished executions beyond the newest `keep` per claim scope,
    /// plus finished executions that started before `older_than`
    async fn trim_history(&self, keep: i64, older_than: Option<DateTime<Utc>>) -> Result<u64>;

    /// Health check - verify store connectivity
    async fn ping(&self) -> Result<()>;

    /// Run schema migrations
    async fn migrate(&self) -> Result<()>;
}

/// Extension trait for TaskStore with schedule-aware convenience methods
#[async_trait]
pub trait TaskStoreExt: TaskStore {
    /// Recompute and persist `next_run_utc` for the given descriptors
    ///
    /// Disabled descriptors get no next run. On app start every enabled
    /// descriptor is recomputed from `now` so schedules missed during downtime
    /// collapse into one due slot; otherwise a next run that still lies in the
    /// future is kept. Invalid expressions get no next run and are logged.
    async fn calculate_future_schedules(
        &self,
        tasks: &[TaskDescriptor],
        is_app_start: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskDescriptor>> {
        let mut updated = Vec::with_capacity(tasks.len());

        for task in tasks {
            let next = if !task.enabled {
                None
            } else if !is_app_start && task.next_run_utc.is_some_and(|next| next > now) {
                task.next_run_utc
            } else {
                match cron::next_schedule(&task.cron_expression, now, None) {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(
                            task_id = task.id,
                            expression = %task.cron_expression,
                            error = %e,
                            "Invalid cron expression, task will not be scheduled"
                        );
                        None
                    }
                }
            };

            if next != task.next_run_utc {
                self.set_next_run(task.id, next).await?;
            }

            let mut task = task.clone();
            task.next_run_utc = next;
            updated.push(task);
        }

        Ok(updated)
    }

    /// Idempotent install-time registration keyed by type name
    async fn get_or_add_task(
        &self,
        task: TaskDescriptor,
        now: DateTime<Utc>,
    ) -> Result<TaskDescriptor> {
        if let Some(existing) = self.get_task_by_type(&task.type_name).await? {
            return Ok(existing);
        }

        let mut task = task;
        if task.enabled && task.next_run_utc.is_none() {
            task.next_run_utc = cron::next_schedule(&task.cron_expression, now, None)
                .map_err(|e| crate::error::SchedulerError::invalid_cron(&task.cron_expression, e))?;
        }
        self.insert_task(&task).await
    }
}

// Blanket implementation
impl<T: TaskStore> TaskStoreExt for T {}
