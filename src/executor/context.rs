//! Execution context handed to task bodies, and the progress port behind it

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::{TaskDescriptor, TaskExecutionInfo};
use crate::storage::TaskStore;

/// Narrow port through which a running task persists its progress
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, percent: Option<i32>, message: Option<&str>) -> Result<()>;
}

/// Writes progress onto the execution record through the task store
pub struct StoreProgressReporter<S: TaskStore> {
    store: S,
    execution_id: i64,
}

impl<S: TaskStore> StoreProgressReporter<S> {
    pub fn new(store: S, execution_id: i64) -> Self {
        Self {
            store,
            execution_id,
        }
    }
}

#[async_trait]
impl<S: TaskStore> ProgressReporter for StoreProgressReporter<S> {
    async fn report(&self, percent: Option<i32>, message: Option<&str>) -> Result<()> {
        // A false result means the run already left `Running`; progress for a
        // finished run is dropped.
        self.store
            .update_progress(self.execution_id, percent, message)
            .await?;
        Ok(())
    }
}

/// Map a value/maximum pair onto 0-100
///
/// Either side missing, or a zero maximum, means indeterminate progress.
pub fn compute_percent(value: Option<i64>, maximum: Option<i64>) -> Option<i32> {
    match (value, maximum) {
        (Some(value), Some(maximum)) if maximum != 0 => {
            let percent = (value as f64 * 100.0 / maximum as f64).round();
            Some(percent.clamp(0.0, 100.0) as i32)
        }
        _ => None,
    }
}

struct PendingProgress {
    percent: Option<i32>,
    message: Option<String>,
}

#[derive(Default)]
struct ProgressBuffer {
    pending: Option<PendingProgress>,
    last_flush: Option<Instant>,
}

struct ProgressChannel {
    reporter: Arc<dyn ProgressReporter>,
    flush_interval: Duration,
    buffer: Mutex<ProgressBuffer>,
}

/// Everything a task body gets to see about its run
#[derive(Clone)]
pub struct TaskExecutionContext {
    descriptor: Arc<TaskDescriptor>,
    execution: Arc<TaskExecutionInfo>,
    parameters: Arc<HashMap<String, String>>,
    progress: Arc<ProgressChannel>,
}

impl TaskExecutionContext {
    pub fn new(
        descriptor: TaskDescriptor,
        execution: TaskExecutionInfo,
        parameters: HashMap<String, String>,
        reporter: Arc<dyn ProgressReporter>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            execution: Arc::new(execution),
            parameters: Arc::new(parameters),
            progress: Arc::new(ProgressChannel {
                reporter,
                flush_interval,
                buffer: Mutex::new(ProgressBuffer::default()),
            }),
        }
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    /// The execution record as it was when the run started
    pub fn execution(&self) -> &TaskExecutionInfo {
        &self.execution
    }

    pub fn task_id(&self) -> i64 {
        self.descriptor.id
    }

    pub fn execution_id(&self) -> i64 {
        self.execution.id
    }

    pub fn machine_name(&self) -> &str {
        &self.execution.machine_name
    }

    /// Parameters passed with a forced run (empty for scheduled runs)
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Report progress as `value` out of `maximum`
    ///
    /// The percentage is rounded and clamped to 0-100. `None` on either side
    /// (or a zero maximum) records indeterminate progress with just the
    /// message. Unless `immediately` is set the write may be batched with the
    /// next one.
    pub async fn set_progress(
        &self,
        value: Option<i64>,
        maximum: Option<i64>,
        message: Option<&str>,
        immediately: bool,
    ) -> Result<()> {
        self.write(compute_percent(value, maximum), message, immediately)
            .await
    }

    /// Report progress as a percentage, clamped to 0-100
    pub async fn set_progress_percent(
        &self,
        percent: Option<i32>,
        message: Option<&str>,
        immediately: bool,
    ) -> Result<()> {
        self.write(percent.map(|p| p.clamp(0, 100)), message, immediately)
            .await
    }

    /// Write out any batched progress
    pub async fn flush_progress(&self) -> Result<()> {
        let pending = {
            let mut buffer = self.progress.buffer.lock();
            buffer.last_flush = Some(Instant::now());
            buffer.pending.take()
        };

        match pending {
            Some(p) => {
                self.progress
                    .reporter
                    .report(p.percent, p.message.as_deref())
                    .await
            }
            None => Ok(()),
        }
    }

    async fn write(&self, percent: Option<i32>, message: Option<&str>, immediately: bool) -> Result<()> {
        let due = {
            let mut buffer = self.progress.buffer.lock();
            buffer.pending = Some(PendingProgress {
                percent,
                message: message.map(str::to_string),
            });

            let interval_elapsed = buffer
                .last_flush
                .map_or(true, |at| at.elapsed() >= self.progress.flush_interval);

            if immediately || interval_elapsed {
                buffer.last_flush = Some(Instant::now());
                buffer.pending.take()
            } else {
                None
            }
        };

        match due {
            Some(p) => {
                self.progress
                    .reporter
                    .report(p.percent, p.message.as_deref())
                    .await
            }
            None => Ok(()),
        }
    }
}
