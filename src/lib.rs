//! # Cadence
//!
//! Cron-driven background tasks for web farms.
//!
//! Cadence runs recurring work inside an ordinary web application:
//! - **Cron schedules**: five-field expressions and `@daily`-style macros
//! - **Farm-safe**: a store-level atomic claim lets exactly one node run a task
//! - **Per-machine tasks**: optionally run a task on every node instead
//! - **Priorities**: high priority tasks are dispatched first within a poll
//! - **HTTP trigger**: nodes poll through `/taskscheduler/poll`, from a
//!   built-in timer or an external cron
//! - **Progress and history**: every run is recorded with its outcome
//!
//! ## Quick Start
//!
//! ```ignore
//! use cadence::{SchedulerConfig, SqliteStore, TaskDescriptor, TaskRegistry, TaskScheduler};
//! use cadence::storage::{TaskStore, TaskStoreExt};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::connect("sqlite://cadence.db").await?;
//!     store.migrate().await?;
//!
//!     let registry = Arc::new(TaskRegistry::new());
//!     registry.register_fn("mail.flush-queue", |ctx, _cancel| {
//!         Box::pin(async move {
//!             ctx.set_progress(Some(1), Some(1), Some("Queue flushed"), true).await?;
//!             Ok(())
//!         })
//!     });
//!
//!     store
//!         .get_or_add_task(
//!             TaskDescriptor::new("Flush mail queue", "mail.flush-queue", "*/5 * * * *"),
//!             chrono::Utc::now(),
//!         )
//!         .await?;
//!
//!     let scheduler = TaskScheduler::new(store, registry, SchedulerConfig::default());
//!     scheduler.initialize().await?;
//!     scheduler.poll().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod tasks;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DatabaseConfig, SchedulerConfig, ServerConfig};
pub use error::{DatabaseError, Result, SchedulerError};
pub use executor::{CompletedRun, TaskExecutionContext, TaskExecutor};
pub use models::{
    ExecutionOutcome, ExecutionStatus, TaskDescriptor, TaskExecutionInfo, TaskPriority,
};
pub use registry::{AsyncFnTask, Task, TaskError, TaskRegistry};
pub use scheduler::{DispatchedRun, PollReport, SelfPoller, TaskScheduler};
pub use storage::{MemoryStore, TaskStore, TaskStoreExt};

#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresStore;

#[cfg(feature = "sqlite")]
pub use storage::sqlite::SqliteStore;

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Result, SchedulerConfig, SchedulerError, Task, TaskDescriptor, TaskError,
        TaskExecutionContext, TaskPriority, TaskRegistry, TaskScheduler, TaskStore, TaskStoreExt,
    };
    pub use tokio_util::sync::CancellationToken;

    #[cfg(feature = "postgres")]
    pub use crate::PostgresStore;

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteStore;
}
