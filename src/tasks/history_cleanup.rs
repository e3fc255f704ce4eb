//! Built-in task that prunes execution history

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::executor::TaskExecutionContext;
use crate::models::{TaskDescriptor, TaskPriority};
use crate::registry::{Task, TaskError};
use crate::storage::TaskStore;

/// Registry key of [`HistoryCleanupTask`]
pub const HISTORY_CLEANUP_TYPE: &str = "cadence.history-cleanup";

/// Prunes finished execution records
///
/// Keeps the newest `keep` records per claim scope (per descriptor, or per
/// descriptor and machine for per-machine descriptors) and drops anything
/// older than `max_age`. Running executions are never touched.
pub struct HistoryCleanupTask<S: TaskStore> {
    store: S,
    clock: Arc<dyn Clock>,
    keep: i64,
    max_age: Option<Duration>,
}

impl<S: TaskStore> HistoryCleanupTask<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, keep: i64, max_age: Option<Duration>) -> Self {
        Self {
            store,
            clock,
            keep: keep.max(0),
            max_age,
        }
    }

    pub fn from_config(store: S, clock: Arc<dyn Clock>, config: &SchedulerConfig) -> Self {
        let max_age = (config.history_max_age_days > 0)
            .then(|| Duration::days(config.history_max_age_days));
        Self::new(store, clock, config.history_keep_per_scope, max_age)
    }

    /// Descriptor to install for this task
    pub fn descriptor(cron_expression: impl Into<String>) -> TaskDescriptor {
        TaskDescriptor::new(
            "Execution history cleanup",
            HISTORY_CLEANUP_TYPE,
            cron_expression,
        )
        .with_priority(TaskPriority::Low)
    }
}

#[async_trait]
impl<S: TaskStore> Task for HistoryCleanupTask<S> {
    async fn run(
        &self,
        ctx: TaskExecutionContext,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let older_than = self.max_age.map(|age| self.clock.now() - age);
        let deleted = self.store.trim_history(self.keep, older_than).await?;

        info!(deleted, keep = self.keep, "Execution history trimmed");
        ctx.set_progress_percent(
            Some(100),
            Some(&format!("Deleted {deleted} execution records")),
            true,
        )
        .await?;
        Ok(())
    }
}
