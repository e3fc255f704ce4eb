//! Executor - runs one claimed task instance to a terminal state
//!
//! The executor is responsible for:
//! - Moving the execution from `Claimed` to `Running`
//! - Invoking the task body with its context and cancellation token
//! - Isolating the body (errors and panics never escape the executor)
//! - Classifying the outcome as succeeded, failed or cancelled
//! - Finalizing the execution record
//!
//! It does not act on the outcome. Policies such as `stop_on_error` belong to
//! the scheduler core, which receives the [`CompletedRun`].

mod context;

pub use context::{
    compute_percent, ProgressReporter, StoreProgressReporter, TaskExecutionContext,
};

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::models::{ExecutionOutcome, TaskDescriptor, TaskExecutionInfo};
use crate::registry::{Task, TaskError};
use crate::storage::TaskStore;

/// Result of one finished execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    pub execution_id: i64,
    pub task_id: i64,
    pub outcome: ExecutionOutcome,
    pub started_on_utc: DateTime<Utc>,
    pub finished_on_utc: DateTime<Utc>,
}

/// Runs claimed executions against a task store
pub struct TaskExecutor<S: TaskStore> {
    store: S,
    clock: Arc<dyn Clock>,
    progress_flush_interval: Duration,
}

impl<S: TaskStore + Clone> TaskExecutor<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, progress_flush_interval: Duration) -> Self {
        Self {
            store,
            clock,
            progress_flush_interval,
        }
    }

    /// Execute a claimed run to completion
    ///
    /// Errors are only returned for store failures around the run; anything
    /// the task body does is captured in the returned outcome.
    pub async fn execute(
        &self,
        task: Arc<dyn Task>,
        descriptor: &TaskDescriptor,
        execution: TaskExecutionInfo,
        parameters: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<CompletedRun> {
        let execution_id = execution.id;
        let started_at = self.clock.now();

        if !self.store.start_run(execution_id, started_at).await? {
            let from = self
                .store
                .get_execution(execution_id)
                .await?
                .map(|e| e.status.as_str())
                .unwrap_or("missing");
            return Err(SchedulerError::InvalidStateTransition {
                from: from.to_string(),
                to: "running".to_string(),
            });
        }

        info!(
            task_id = descriptor.id,
            execution_id,
            task = %descriptor.name,
            machine = %execution.machine_name,
            "Task started"
        );

        let reporter = Arc::new(StoreProgressReporter::new(self.store.clone(), execution_id));
        let mut running = execution;
        running.started_on_utc = started_at;
        let ctx = TaskExecutionContext::new(
            descriptor.clone(),
            running,
            parameters,
            reporter,
            self.progress_flush_interval,
        );

        // The body runs in its own task so a panic surfaces as a JoinError
        // instead of unwinding through the scheduler.
        let body_ctx = ctx.clone();
        let body_cancel = cancel.clone();
        let handle = tokio::spawn(async move { task.run(body_ctx, body_cancel).await });
        let outcome = classify(handle.await, &cancel);

        if let Err(e) = ctx.flush_progress().await {
            warn!(execution_id, error = %e, "Failed to flush progress");
        }

        let finished_at = self.clock.now();
        if !self
            .store
            .complete_run(execution_id, &outcome, finished_at)
            .await?
        {
            warn!(execution_id, "Execution was already finalized elsewhere");
        }

        match &outcome {
            ExecutionOutcome::Succeeded => {
                info!(task_id = descriptor.id, execution_id, "Task succeeded");
            }
            ExecutionOutcome::Failed { error } => {
                error!(task_id = descriptor.id, execution_id, error = %error, "Task failed");
            }
            ExecutionOutcome::Cancelled => {
                warn!(task_id = descriptor.id, execution_id, "Task cancelled");
            }
        }

        Ok(CompletedRun {
            execution_id,
            task_id: descriptor.id,
            outcome,
            started_on_utc: started_at,
            finished_on_utc: finished_at,
        })
    }
}

fn classify(
    result: std::result::Result<std::result::Result<(), TaskError>, tokio::task::JoinError>,
    cancel: &CancellationToken,
) -> ExecutionOutcome {
    match result {
        Ok(Ok(())) => ExecutionOutcome::Succeeded,
        Ok(Err(TaskError::Cancelled)) => ExecutionOutcome::Cancelled,
        // Errors raised while unwinding a cancelled run count as cancellation
        Ok(Err(_)) if cancel.is_cancelled() => ExecutionOutcome::Cancelled,
        Ok(Err(TaskError::Failed(message))) => ExecutionOutcome::Failed {
            error: if message.is_empty() {
                "Task failed".to_string()
            } else {
                message
            },
        },
        Err(join_error) if join_error.is_panic() => ExecutionOutcome::Failed {
            error: format!("Task panicked: {}", panic_message(join_error.into_panic())),
        },
        Err(_) => ExecutionOutcome::Cancelled,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
