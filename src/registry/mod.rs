//! Task Registry - maps task type names to executable implementations
//!
//! Descriptors name their implementation with a stable string key
//! (`type_name`). Implementations are registered explicitly at startup, either
//! as a shared instance, a factory producing a fresh instance per run, or a
//! plain async closure.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::executor::TaskExecutionContext;

/// Error returned by a task body
#[derive(Error, Debug)]
pub enum TaskError {
    /// The task failed; the message is recorded on the execution
    #[error("{0}")]
    Failed(String),

    /// The task observed its cancellation token and stopped
    #[error("Task was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

impl From<SchedulerError> for TaskError {
    fn from(err: SchedulerError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// A unit of background work
///
/// Long-running tasks should check `cancel` periodically and return
/// [`TaskError::Cancelled`] once it fires.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(
        &self,
        ctx: TaskExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<(), TaskError>;
}

type BoxedTaskFuture = Pin<Box<dyn Future<Output = std::result::Result<(), TaskError>> + Send>>;

/// Wrapper for async task closures
pub struct AsyncFnTask<F>
where
    F: Fn(TaskExecutionContext, CancellationToken) -> BoxedTaskFuture + Send + Sync,
{
    func: F,
}

impl<F> AsyncFnTask<F>
where
    F: Fn(TaskExecutionContext, CancellationToken) -> BoxedTaskFuture + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Task for AsyncFnTask<F>
where
    F: Fn(TaskExecutionContext, CancellationToken) -> BoxedTaskFuture + Send + Sync,
{
    async fn run(
        &self,
        ctx: TaskExecutionContext,
        cancel: CancellationToken,
    ) -> std::result::Result<(), TaskError> {
        (self.func)(ctx, cancel).await
    }
}

type TaskFactory = Arc<dyn Fn() -> Arc<dyn Task> + Send + Sync>;

/// Task registry - resolves descriptor type names to task instances
pub struct TaskRegistry {
    factories: DashMap<String, TaskFactory>,
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Register a factory that builds a fresh instance for every run
    pub fn register_with<F, T>(&self, type_name: impl Into<String>, factory: F) -> &Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Task + 'static,
    {
        let type_name = type_name.into();
        let factory: TaskFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Task>);
        self.factories.insert(type_name.clone(), factory);

        info!(type_name = %type_name, "Registered task type");
        self
    }

    /// Register one instance shared by all runs
    pub fn register<T: Task + 'static>(&self, type_name: impl Into<String>, task: T) -> &Self {
        let type_name = type_name.into();
        let task: Arc<dyn Task> = Arc::new(task);
        let factory: TaskFactory = Arc::new(move || task.clone());
        self.factories.insert(type_name.clone(), factory);

        info!(type_name = %type_name, "Registered task type");
        self
    }

    /// Register a task using a closure
    pub fn register_fn<F>(&self, type_name: impl Into<String>, func: F) -> &Self
    where
        F: Fn(TaskExecutionContext, CancellationToken) -> BoxedTaskFuture
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, AsyncFnTask::new(func))
    }

    /// Resolve a type name to a runnable instance
    pub fn resolve(&self, type_name: &str) -> Result<Arc<dyn Task>> {
        self.factories
            .get(type_name)
            .map(|factory| (factory.value())())
            .ok_or_else(|| SchedulerError::TaskTypeNotRegistered {
                type_name: type_name.to_string(),
            })
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Get all registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
