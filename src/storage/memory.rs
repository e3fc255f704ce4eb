//! In-process implementation of TaskStore
//!
//! All state lives behind one mutex, so every operation (the claim's
//! check-and-insert in particular) is atomic with respect to every other.
//! Clones share the same state, which lets tests simulate several web-farm
//! nodes against one "database".

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{DatabaseError, Result, SchedulerError};
use crate::models::{
    ClaimRequest, ExecutionOutcome, ExecutionStatus, TaskDescriptor, TaskExecutionInfo,
};
use crate::storage::TaskStore;

#[derive(Debug, Clone)]
struct ExecutionRecord {
    info: TaskExecutionInfo,
    claim_key: String,
}

#[derive(Debug, Default)]
struct State {
    tasks: BTreeMap<i64, TaskDescriptor>,
    executions: BTreeMap<i64, ExecutionRecord>,
    next_task_id: i64,
    next_execution_id: i64,
}

impl State {
    fn newest<'a>(
        &'a self,
        mut filter: impl FnMut(&ExecutionRecord) -> bool,
    ) -> Option<&'a ExecutionRecord> {
        self.executions
            .values()
            .filter(|r| filter(r))
            .max_by_key(|r| (r.info.started_on_utc, r.info.id))
    }
}

/// Mutex-backed store; clones share state
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable store: every operation fails while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DatabaseError::Connection("store is offline".to_string()).into());
        }
        Ok(())
    }
}

fn finish(info: &mut TaskExecutionInfo, outcome: &ExecutionOutcome, at: DateTime<Utc>) {
    info.status = outcome.status();
    info.finished_on_utc = Some(at);
    info.succeeded_on_utc = matches!(outcome, ExecutionOutcome::Succeeded).then_some(at);
    info.error = outcome.error().map(str::to_string);
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_all_tasks(&self, include_disabled: bool) -> Result<Vec<TaskDescriptor>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .tasks
            .values()
            .filter(|t| include_disabled || t.enabled)
            .cloned()
            .collect())
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskDescriptor>> {
        self.check()?;
        Ok(self.state.lock().tasks.get(&id).cloned())
    }

    async fn get_task_by_type(&self, type_name: &str) -> Result<Option<TaskDescriptor>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .tasks
            .values()
            .find(|t| t.type_name == type_name)
            .cloned())
    }

    async fn insert_task(&self, task: &TaskDescriptor) -> Result<TaskDescriptor> {
        self.check()?;
        let mut state = self.state.lock();
        state.next_task_id += 1;

        let mut task = task.clone();
        task.id = state.next_task_id;
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn update_task(&self, task: &TaskDescriptor) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        match state.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(SchedulerError::TaskNotFound { id: task.id }),
        }
    }

    async fn delete_task(&self, id: i64) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        let removed = state.tasks.remove(&id).is_some();
        state.executions.retain(|_, r| r.info.task_id != id);
        Ok(removed)
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        task.enabled = enabled;
        if !enabled {
            task.next_run_utc = None;
        }
        Ok(())
    }

    async fn set_next_run(&self, id: i64, next_run_utc: Option<DateTime<Utc>>) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;
        task.next_run_utc = next_run_utc;
        Ok(())
    }

    async fn try_claim(&self, request: &ClaimRequest<'_>) -> Result<Option<TaskExecutionInfo>> {
        self.check()?;
        let mut state = self.state.lock();

        if !state.tasks.contains_key(&request.task_id) {
            return Ok(None);
        }

        let key = request.scope.key();
        let blocked = state.executions.values().any(|r| {
            r.info.task_id == request.task_id
                && r.claim_key == key
                && (r.info.is_running()
                    || request
                        .due_slot
                        .is_some_and(|slot| r.info.started_on_utc >= slot))
        });
        if blocked {
            return Ok(None);
        }

        state.next_execution_id += 1;
        let info = TaskExecutionInfo {
            id: state.next_execution_id,
            task_id: request.task_id,
            machine_name: request.machine_name.to_string(),
            status: ExecutionStatus::Claimed,
            started_on_utc: request.claimed_at,
            finished_on_utc: None,
            succeeded_on_utc: None,
            error: None,
            progress_percent: None,
            progress_message: None,
        };
        state.executions.insert(
            info.id,
            ExecutionRecord {
                info: info.clone(),
                claim_key: key.to_string(),
            },
        );
        Ok(Some(info))
    }

    async fn start_run(&self, execution_id: i64, started_at: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.executions.get_mut(&execution_id) {
            Some(r) if r.info.status == ExecutionStatus::Claimed => {
                r.info.status = ExecutionStatus::Running;
                r.info.started_on_utc = started_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        execution_id: i64,
        percent: Option<i32>,
        message: Option<&str>,
    ) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.executions.get_mut(&execution_id) {
            Some(r) if r.info.status == ExecutionStatus::Running => {
                r.info.progress_percent = percent;
                r.info.progress_message = message.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_run(
        &self,
        execution_id: i64,
        outcome: &ExecutionOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.executions.get_mut(&execution_id) {
            Some(r) if r.info.is_running() => {
                finish(&mut r.info, outcome, finished_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_execution(&self, id: i64) -> Result<Option<TaskExecutionInfo>> {
        self.check()?;
        Ok(self.state.lock().executions.get(&id).map(|r| r.info.clone()))
    }

    async fn get_last_execution(
        &self,
        task_id: i64,
        machine_name: Option<&str>,
    ) -> Result<Option<TaskExecutionInfo>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .newest(|r| {
                r.info.task_id == task_id
                    && machine_name.map_or(true, |m| r.info.machine_name == m)
            })
            .map(|r| r.info.clone()))
    }

    async fn get_running_executions(
        &self,
        machine_name: Option<&str>,
    ) -> Result<Vec<TaskExecutionInfo>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .executions
            .values()
            .filter(|r| {
                r.info.is_running() && machine_name.map_or(true, |m| r.info.machine_name == m)
            })
            .map(|r| r.info.clone())
            .collect())
    }

    async fn get_execution_history(
        &self,
        task_id: i64,
        limit: i64,
    ) -> Result<Vec<TaskExecutionInfo>> {
        self.check()?;
        let state = self.state.lock();
        let mut history: Vec<TaskExecutionInfo> = state
            .executions
            .values()
            .filter(|r| r.info.task_id == task_id)
            .map(|r| r.info.clone())
            .collect();
        history.sort_by(|a, b| (b.started_on_utc, b.id).cmp(&(a.started_on_utc, a.id)));
        history.truncate(limit.max(0) as usize);
        Ok(history)
    }

    async fn abandon_machine_runs(
        &self,
        machine_name: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let outcome = ExecutionOutcome::Failed {
            error: reason.to_string(),
        };

        let mut count = 0;
        for r in state.executions.values_mut() {
            if r.info.is_running() && r.info.machine_name == machine_name {
                finish(&mut r.info, &outcome, at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn abandon_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let outcome = ExecutionOutcome::Failed {
            error: reason.to_string(),
        };

        let mut count = 0;
        for r in state.executions.values_mut() {
            if r.info.is_running() && r.info.started_on_utc < started_before {
                finish(&mut r.info, &outcome, at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn trim_history(&self, keep: i64, older_than: Option<DateTime<Utc>>) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock();

        let mut scopes: HashMap<(i64, String), Vec<(DateTime<Utc>, i64)>> = HashMap::new();
        for r in state.executions.values() {
            scopes
                .entry((r.info.task_id, r.claim_key.clone()))
                .or_default()
                .push((r.info.started_on_utc, r.info.id));
        }

        let mut doomed = Vec::new();
        for mut entries in scopes.into_values() {
            entries.sort_by(|a, b| b.cmp(a));
            for (rank, (started, id)) in entries.into_iter().enumerate() {
                let beyond_keep = rank as i64 >= keep;
                let expired = older_than.is_some_and(|cutoff| started < cutoff);
                if beyond_keep || expired {
                    doomed.push(id);
                }
            }
        }

        let mut removed = 0;
        for id in doomed {
            let finished = state
                .executions
                .get(&id)
                .is_some_and(|r| r.info.status.is_terminal());
            if finished {
                state.executions.remove(&id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn migrate(&self) -> Result<()> {
        Ok(())
    }
}
