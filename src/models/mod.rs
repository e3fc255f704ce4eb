//! Domain models for scheduled tasks and their execution history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relative importance of a task when several are due in the same poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Lifecycle state of one execution attempt
///
/// `Claimed -> Running -> {Succeeded | Failed | Cancelled}`. Terminal states
/// are never left again; progress may only be written while `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Claimed by a runner, not started yet
    Claimed,
    /// Task body is executing
    Running,
    /// Completed without error
    Succeeded,
    /// Task body returned an error or panicked
    Failed,
    /// Stopped through its cancellation token
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Claimed and running executions both hold the claim
    pub fn is_running(&self) -> bool {
        !self.is_terminal()
    }
}

/// Persisted definition of a recurring job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Store-assigned identifier (0 until inserted)
    pub id: i64,
    /// Human-readable name
    pub name: String,
    /// Registry key of the implementation
    pub type_name: String,
    /// Five-field cron expression (or `@daily`-style macro)
    pub cron_expression: String,
    pub enabled: bool,
    pub priority: TaskPriority,
    /// Every machine runs its own instance instead of one machine per farm
    pub run_per_machine: bool,
    /// Disable the descriptor after a failed run
    pub stop_on_error: bool,
    /// Next due time; `None` for disabled descriptors or dead expressions
    pub next_run_utc: Option<DateTime<Utc>>,
}

impl TaskDescriptor {
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            type_name: type_name.into(),
            cron_expression: cron_expression.into(),
            enabled: true,
            priority: TaskPriority::Normal,
            run_per_machine: false,
            stop_on_error: false,
            next_run_utc: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn per_machine(mut self) -> Self {
        self.run_per_machine = true;
        self
    }

    pub fn stop_on_error(mut self) -> Self {
        self.stop_on_error = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_next_run(mut self, next_run_utc: DateTime<Utc>) -> Self {
        self.next_run_utc = Some(next_run_utc);
        self
    }

    /// Claim key scope: the machine name for per-machine tasks, otherwise the
    /// whole farm
    pub fn claim_scope<'a>(&self, machine_name: &'a str) -> ClaimScope<'a> {
        if self.run_per_machine {
            ClaimScope::Machine(machine_name)
        } else {
            ClaimScope::Global
        }
    }
}

/// Who must not already be running a descriptor for a claim to succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimScope<'a> {
    Global,
    Machine(&'a str),
}

impl ClaimScope<'_> {
    /// Value stored in the `claim_key` column
    pub fn key(&self) -> &str {
        match self {
            Self::Global => "",
            Self::Machine(name) => name,
        }
    }

    pub fn covers(&self, machine_name: &str) -> bool {
        match self {
            Self::Global => true,
            Self::Machine(name) => *name == machine_name,
        }
    }
}

/// A request to claim a descriptor for execution
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub task_id: i64,
    pub machine_name: &'a str,
    pub scope: ClaimScope<'a>,
    /// Due slot being claimed. When set, the claim also fails if an execution
    /// in the same scope already started at or after this instant.
    pub due_slot: Option<DateTime<Utc>>,
    pub claimed_at: DateTime<Utc>,
}

/// One execution attempt of a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionInfo {
    pub id: i64,
    pub task_id: i64,
    pub machine_name: String,
    pub status: ExecutionStatus,
    pub started_on_utc: DateTime<Utc>,
    pub finished_on_utc: Option<DateTime<Utc>>,
    /// Set only on success
    pub succeeded_on_utc: Option<DateTime<Utc>>,
    /// Set only on failure
    pub error: Option<String>,
    /// 0-100, `None` when indeterminate
    pub progress_percent: Option<i32>,
    pub progress_message: Option<String>,
}

impl TaskExecutionInfo {
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// Terminal result of one execution, as classified by the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed { error: String },
    Cancelled,
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Succeeded => ExecutionStatus::Succeeded,
            Self::Failed { .. } => ExecutionStatus::Failed,
            Self::Cancelled => ExecutionStatus::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
