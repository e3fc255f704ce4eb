//! Scheduler Core - the poll/claim/dispatch state machine
//!
//! Each poll:
//! 1. abandons runs that exceeded the stale-run timeout
//! 2. collects due descriptors, ordered by priority then due time
//! 3. resolves each implementation and claims it through the store
//! 4. dispatches claimed runs fire-and-forget
//!
//! When a run finishes, a continuation recomputes the descriptor's next run
//! from the cron expression and the completion time (or disables it when it
//! failed and `stop_on_error` is set). Per-machine descriptors are due from
//! each machine's own last execution instead.
//!
//! Nodes never coordinate in memory: exclusivity comes entirely from the
//! store's atomic claim.

pub mod cron;
mod poller;
mod priority;
mod startup;

pub use poller::SelfPoller;
pub use priority::{order_due, DueTask};
pub use startup::{calculate_backoff, with_retry, InitRetryPolicy};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::executor::TaskExecutor;
use crate::models::{ClaimRequest, ExecutionOutcome, TaskDescriptor, TaskExecutionInfo};
use crate::registry::{Task, TaskRegistry};
use crate::storage::{TaskStore, TaskStoreExt};

const ABANDONED_ON_RESTART: &str = "Abandoned: the machine running this task restarted";
const ABANDONED_STALE: &str = "Abandoned: run exceeded the stale run timeout";

/// A run handed to the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchedRun {
    pub task_id: i64,
    pub execution_id: i64,
}

/// A due descriptor that was not claimed this cycle because of a fault
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub task_id: i64,
    pub reason: String,
}

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Number of descriptors found due
    pub due: usize,
    /// Claimed and dispatched, in dispatch order
    pub dispatched: Vec<DispatchedRun>,
    /// Due but another runner holds the claim
    pub claim_lost: Vec<i64>,
    /// Due but skipped (unknown type, bad cron, store error)
    pub skipped: Vec<SkippedTask>,
    /// Stale runs abandoned before collecting
    pub abandoned: u64,
}

struct RunningEntry {
    task_id: i64,
    cancel: CancellationToken,
}

struct SchedulerInner<S: TaskStore> {
    store: S,
    registry: Arc<TaskRegistry>,
    executor: TaskExecutor<S>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    active: AtomicBool,
    shutdown: CancellationToken,
    running: DashMap<i64, RunningEntry>,
    tracker: TaskTracker,
}

/// The task scheduler of one node; cheap to clone
pub struct TaskScheduler<S: TaskStore> {
    inner: Arc<SchedulerInner<S>>,
}

impl<S: TaskStore> Clone for TaskScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: TaskStore + Clone> TaskScheduler<S> {
    pub fn new(store: S, registry: Arc<TaskRegistry>, config: SchedulerConfig) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: S,
        registry: Arc<TaskRegistry>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let executor = TaskExecutor::new(
            store.clone(),
            clock.clone(),
            config.progress_flush_interval(),
        );

        Self {
            inner: Arc::new(SchedulerInner {
                store,
                registry,
                executor,
                clock,
                config,
                active: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                running: DashMap::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn machine_name(&self) -> &str {
        &self.inner.config.machine_name
    }

    /// Whether initialization succeeded and the scheduler accepts polls
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Fires when the scheduler shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Number of runs executing in this process
    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// App-start initialization with bounded retry
    ///
    /// Verifies the store, fails this machine's runs orphaned by a previous
    /// process, and recomputes every schedule from now. If the store stays
    /// unreachable for all attempts the scheduler remains inactive and the
    /// last error is returned.
    pub async fn initialize(&self) -> Result<()> {
        let policy = InitRetryPolicy::from(&self.inner.config);

        match with_retry(&policy, move |_| self.try_initialize()).await {
            Ok(task_count) => {
                self.inner.active.store(true, Ordering::SeqCst);
                info!(
                    machine = %self.machine_name(),
                    tasks = task_count,
                    "Task scheduler initialized"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    attempts = policy.max_attempts,
                    error = %e,
                    "Task scheduler could not be initialized, background tasks will not run"
                );
                Err(e)
            }
        }
    }

    async fn try_initialize(&self) -> Result<usize> {
        let store = &self.inner.store;
        store.ping().await?;

        let now = self.inner.clock.now();
        let abandoned = store
            .abandon_machine_runs(self.machine_name(), ABANDONED_ON_RESTART, now)
            .await?;
        if abandoned > 0 {
            warn!(count = abandoned, machine = %self.machine_name(), "Abandoned orphaned runs");
        }

        let tasks = store.get_all_tasks(true).await?;
        store.calculate_future_schedules(&tasks, true, now).await?;
        Ok(tasks.len())
    }

    // =========================================================================
    // Poll
    // =========================================================================

    /// Evaluate and dispatch everything that is due
    ///
    /// Returns once dispatch has begun; runs finish in the background.
    pub async fn poll(&self) -> Result<PollReport> {
        if !self.is_active() {
            return Err(SchedulerError::NotActive);
        }

        let inner = &self.inner;
        let now = inner.clock.now();
        let mut report = PollReport::default();

        let stale_before =
            now - chrono::Duration::seconds(inner.config.stale_run_timeout_secs as i64);
        match inner
            .store
            .abandon_stale_runs(stale_before, ABANDONED_STALE, now)
            .await
        {
            Ok(0) => {}
            Ok(count) => {
                warn!(count, "Abandoned stale runs");
                report.abandoned = count;
            }
            Err(e) => warn!(error = %e, "Failed to abandon stale runs"),
        }

        let due = self.collect_due(now, &mut report).await?;
        report.due = due.len();

        for item in due {
            let DueTask { task, due_slot } = item;

            let instance = match inner.registry.resolve(&task.type_name) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "Skipping task");
                    report.skipped.push(SkippedTask {
                        task_id: task.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let request = ClaimRequest {
                task_id: task.id,
                machine_name: self.machine_name(),
                scope: task.claim_scope(self.machine_name()),
                due_slot: Some(due_slot),
                claimed_at: now,
            };

            match inner.store.try_claim(&request).await {
                Ok(Some(execution)) => {
                    report.dispatched.push(DispatchedRun {
                        task_id: task.id,
                        execution_id: execution.id,
                    });
                    self.dispatch(instance, task, execution, HashMap::new());
                }
                Ok(None) => {
                    debug!(task_id = task.id, "Claim lost, task is running elsewhere");
                    report.claim_lost.push(task.id);
                }
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "Failed to claim task");
                    report.skipped.push(SkippedTask {
                        task_id: task.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(
            due = report.due,
            dispatched = report.dispatched.len(),
            claim_lost = report.claim_lost.len(),
            skipped = report.skipped.len(),
            "Poll completed"
        );
        Ok(report)
    }

    async fn collect_due(
        &self,
        now: DateTime<Utc>,
        report: &mut PollReport,
    ) -> Result<Vec<DueTask>> {
        let store = &self.inner.store;
        let mut due = Vec::new();

        for task in store.get_all_tasks(false).await? {
            if let Err(e) = cron::validate(&task.cron_expression) {
                let e = SchedulerError::invalid_cron(&task.cron_expression, e);
                warn!(task_id = task.id, error = %e, "Skipping task");
                report.skipped.push(SkippedTask {
                    task_id: task.id,
                    reason: e.to_string(),
                });
                continue;
            }

            let slot = if task.run_per_machine {
                // Each machine follows its own history
                match store
                    .get_last_execution(task.id, Some(self.machine_name()))
                    .await?
                {
                    Some(last) if last.is_running() => continue,
                    Some(last) => cron::next_schedule(
                        &task.cron_expression,
                        last.finished_on_utc.unwrap_or(last.started_on_utc),
                        Some(last.started_on_utc),
                    )
                    .ok()
                    .flatten(),
                    None => task.next_run_utc,
                }
            } else {
                self.unconsumed_slot(&task, now).await?
            };

            match slot {
                Some(slot) if slot <= now => due.push(DueTask::new(task, slot)),
                Some(_) => {}
                None if task.next_run_utc.is_none() => {
                    // Enabled but never scheduled (e.g. re-enabled by an admin)
                    let next = cron::next_schedule(&task.cron_expression, now, None)
                        .ok()
                        .flatten();
                    store.set_next_run(task.id, next).await?;
                    debug!(task_id = task.id, next_run = ?next, "Repaired missing schedule");
                }
                None => {}
            }
        }

        Ok(order_due(due))
    }

    /// Stored next run of a single-runner descriptor, moved forward when a
    /// finished run already covers it
    ///
    /// A run abandoned as stale, or one whose continuation failed to persist
    /// the new schedule, leaves `next_run_utc` on a slot the claim guard will
    /// always reject.
    async fn unconsumed_slot(
        &self,
        task: &TaskDescriptor,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(slot) = task.next_run_utc.filter(|slot| *slot <= now) else {
            return Ok(task.next_run_utc);
        };

        let store = &self.inner.store;
        match store.get_last_execution(task.id, None).await? {
            Some(last) if !last.is_running() && last.started_on_utc >= slot => {
                let next = cron::next_schedule(
                    &task.cron_expression,
                    last.finished_on_utc.unwrap_or(last.started_on_utc),
                    Some(last.started_on_utc),
                )
                .ok()
                .flatten();
                store.set_next_run(task.id, next).await?;
                debug!(task_id = task.id, next_run = ?next, "Moved schedule past a finished run");
                Ok(next)
            }
            _ => Ok(Some(slot)),
        }
    }

    // =========================================================================
    // Forced runs and cancellation
    // =========================================================================

    /// Claim and run one descriptor now
    ///
    /// Bypasses the enabled flag and the due-time check, but not claim
    /// exclusivity: a descriptor already running in its scope yields
    /// `AlreadyRunning`.
    pub async fn run_single(
        &self,
        task_id: i64,
        parameters: HashMap<String, String>,
    ) -> Result<DispatchedRun> {
        if !self.is_active() {
            return Err(SchedulerError::NotActive);
        }

        let inner = &self.inner;
        let task = inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        let instance = inner.registry.resolve(&task.type_name)?;

        let request = ClaimRequest {
            task_id,
            machine_name: self.machine_name(),
            scope: task.claim_scope(self.machine_name()),
            due_slot: None,
            claimed_at: inner.clock.now(),
        };
        let execution = inner
            .store
            .try_claim(&request)
            .await?
            .ok_or(SchedulerError::AlreadyRunning { id: task_id })?;

        info!(task_id, execution_id = execution.id, "Forced task run");
        let dispatched = DispatchedRun {
            task_id,
            execution_id: execution.id,
        };
        self.dispatch(instance, task, execution, parameters);
        Ok(dispatched)
    }

    /// Signal cancellation to this node's runs of a descriptor
    ///
    /// Returns whether any run was signalled.
    pub fn request_cancel(&self, task_id: i64) -> bool {
        let mut signalled = false;
        for entry in self.inner.running.iter() {
            if entry.task_id == task_id {
                entry.cancel.cancel();
                signalled = true;
            }
        }

        if signalled {
            info!(task_id, "Cancellation requested");
        }
        signalled
    }

    /// Stop accepting polls, cancel every run and wait up to the grace period
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.active.store(false, Ordering::SeqCst);
        inner.shutdown.cancel();
        inner.tracker.close();

        if tokio::time::timeout(inner.config.shutdown_grace(), inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = inner.tracker.len(),
                "Shutdown grace period elapsed with runs still active"
            );
        }
        info!("Task scheduler stopped");
    }

    /// Wait until every dispatched run and its continuation has finished
    pub async fn wait_idle(&self) {
        let tracker = &self.inner.tracker;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    // =========================================================================
    // Dispatch and continuation
    // =========================================================================

    fn dispatch(
        &self,
        instance: Arc<dyn Task>,
        task: TaskDescriptor,
        execution: TaskExecutionInfo,
        parameters: HashMap<String, String>,
    ) {
        let inner = self.inner.clone();
        let cancel = inner.shutdown.child_token();
        let execution_id = execution.id;
        let started = execution.started_on_utc;

        inner.running.insert(
            execution_id,
            RunningEntry {
                task_id: task.id,
                cancel: cancel.clone(),
            },
        );

        let span = info_span!("task_run", task_id = task.id, execution_id);
        self.inner.tracker.spawn(
            async move {
                let result = inner
                    .executor
                    .execute(instance, &task, execution, parameters, cancel)
                    .await;
                inner.running.remove(&execution_id);

                let (outcome, started, finished) = match result {
                    Ok(run) => (run.outcome, run.started_on_utc, run.finished_on_utc),
                    Err(e) => {
                        error!(error = %e, "Task execution could not be recorded");
                        let outcome = ExecutionOutcome::Failed {
                            error: e.to_string(),
                        };
                        let finished = inner.clock.now();
                        if let Err(e) = inner
                            .store
                            .complete_run(execution_id, &outcome, finished)
                            .await
                        {
                            error!(error = %e, "Failed to release claim");
                        }
                        (outcome, started, finished)
                    }
                };

                if let Err(e) = inner.reschedule(task.id, &outcome, started, finished).await {
                    error!(error = %e, "Failed to update schedule after run");
                }
            }
            .instrument(span),
        );
    }
}

impl<S: TaskStore> SchedulerInner<S> {
    async fn reschedule(
        &self,
        task_id: i64,
        outcome: &ExecutionOutcome,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> Result<()> {
        // Uninstalled while running
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };

        if outcome.is_failure() && task.stop_on_error {
            self.store.set_enabled(task_id, false).await?;
            warn!(task_id, "Task disabled after failure");
            return Ok(());
        }

        if !task.enabled {
            if task.next_run_utc.is_some() {
                self.store.set_next_run(task_id, None).await?;
            }
            return Ok(());
        }

        // Machines follow their own history; the stored next run stays the
        // baseline for machines that have not run the task yet
        if task.run_per_machine {
            return Ok(());
        }

        let next = cron::next_schedule(&task.cron_expression, finished, Some(started))
            .map_err(|e| SchedulerError::invalid_cron(&task.cron_expression, e))?;
        self.store.set_next_run(task_id, next).await?;
        debug!(task_id, next_run = ?next, "Task rescheduled");
        Ok(())
    }
}
