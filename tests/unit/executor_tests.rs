//! Executor module tests

use cadence::clock::{Clock, ManualClock};
use cadence::executor::{compute_percent, TaskExecutor};
use cadence::models::{
    ClaimRequest, ClaimScope, ExecutionOutcome, ExecutionStatus, TaskDescriptor, TaskExecutionInfo,
};
use cadence::registry::{AsyncFnTask, Task, TaskError};
use cadence::storage::{MemoryStore, TaskStore};
use cadence::{SchedulerError, TaskExecutionContext};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

fn task_fn<F, Fut>(f: F) -> Arc<dyn Task>
where
    F: Fn(TaskExecutionContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Arc::new(AsyncFnTask::new(move |ctx, cancel| {
        Box::pin(f(ctx, cancel)) as TaskFuture
    }))
}

struct Harness {
    store: MemoryStore,
    clock: Arc<ManualClock>,
    executor: TaskExecutor<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let executor = TaskExecutor::new(
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            Duration::from_secs(3600),
        );
        Self {
            store,
            clock,
            executor,
        }
    }

    async fn claim(&self) -> (TaskDescriptor, TaskExecutionInfo) {
        let task = self
            .store
            .insert_task(&TaskDescriptor::new("Report", "reports.build", "*/5 * * * *"))
            .await
            .unwrap();
        let execution = self
            .store
            .try_claim(&ClaimRequest {
                task_id: task.id,
                machine_name: "web-1",
                scope: ClaimScope::Global,
                due_slot: None,
                claimed_at: self.clock.now(),
            })
            .await
            .unwrap()
            .expect("claim should succeed");
        (task, execution)
    }

    async fn run(&self, task: Arc<dyn Task>, cancel: CancellationToken) -> TaskExecutionInfo {
        self.run_with(task, HashMap::new(), cancel).await
    }

    async fn run_with(
        &self,
        task: Arc<dyn Task>,
        parameters: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> TaskExecutionInfo {
        let (descriptor, execution) = self.claim().await;
        let completed = self
            .executor
            .execute(task, &descriptor, execution, parameters, cancel)
            .await
            .unwrap();
        self.store
            .get_execution(completed.execution_id)
            .await
            .unwrap()
            .unwrap()
    }
}

#[tokio::test]
async fn test_successful_run() {
    let harness = Harness::new();
    let record = harness
        .run(task_fn(|_, _| async { Ok(()) }), CancellationToken::new())
        .await;

    let now = harness.clock.now();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(record.started_on_utc, now);
    assert_eq!(record.finished_on_utc, Some(now));
    assert_eq!(record.succeeded_on_utc, Some(now));
    assert_eq!(record.error, None);
}

#[tokio::test]
async fn test_failed_run_records_message() {
    let harness = Harness::new();
    let record = harness
        .run(
            task_fn(|_, _| async { Err(TaskError::failed("smtp unreachable")) }),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("smtp unreachable"));
    assert_eq!(record.succeeded_on_utc, None);
    assert!(record.finished_on_utc.is_some());
}

#[tokio::test]
async fn test_panic_is_contained() {
    let harness = Harness::new();
    let record = harness
        .run(
            task_fn(|_, _| async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(())
            }),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("Task panicked: boom"));
}

#[tokio::test]
async fn test_cancelled_run() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let record = harness
        .run(
            task_fn(|_, cancel| async move {
                cancel.cancelled().await;
                Err(TaskError::Cancelled)
            }),
            cancel,
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.error, None);
    assert_eq!(record.succeeded_on_utc, None);
}

#[tokio::test]
async fn test_progress_is_persisted_and_flushed() {
    let harness = Harness::new();
    let record = harness
        .run(
            task_fn(|ctx, _| async move {
                // First write goes straight through
                ctx.set_progress(Some(1), Some(10), Some("starting"), false)
                    .await?;
                // Batched behind the flush interval until the run ends
                ctx.set_progress(Some(3), Some(4), Some("almost"), false)
                    .await?;
                Ok::<_, TaskError>(())
            }),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(record.progress_percent, Some(75));
    assert_eq!(record.progress_message.as_deref(), Some("almost"));
}

#[tokio::test]
async fn test_indeterminate_progress() {
    let harness = Harness::new();
    let record = harness
        .run(
            task_fn(|ctx, _| async move {
                ctx.set_progress(None, Some(10), Some("waiting"), true)
                    .await?;
                Ok::<_, TaskError>(())
            }),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(record.progress_percent, None);
    assert_eq!(record.progress_message.as_deref(), Some("waiting"));
}

#[tokio::test]
async fn test_parameters_reach_the_task() {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(None));

    let captured = seen.clone();
    let task = task_fn(move |ctx, _| {
        let captured = captured.clone();
        async move {
            *captured.lock() = ctx.parameter("since").map(str::to_string);
            Ok(())
        }
    });

    let parameters = HashMap::from([("since".to_string(), "2024-01-01".to_string())]);
    harness
        .run_with(task, parameters, CancellationToken::new())
        .await;

    assert_eq!(seen.lock().as_deref(), Some("2024-01-01"));
}

#[tokio::test]
async fn test_execute_requires_claimed_execution() {
    let harness = Harness::new();
    let (descriptor, execution) = harness.claim().await;
    let noop = task_fn(|_, _| async { Ok(()) });

    harness
        .executor
        .execute(
            noop.clone(),
            &descriptor,
            execution.clone(),
            HashMap::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let err = harness
        .executor
        .execute(
            noop,
            &descriptor,
            execution,
            HashMap::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::InvalidStateTransition { ref from, .. } if from == "succeeded"
    ));
}

#[test]
fn test_compute_percent() {
    let cases = vec![
        ((Some(50), Some(100)), Some(50)),
        ((Some(1), Some(3)), Some(33)),
        ((Some(2), Some(3)), Some(67)),
        ((Some(150), Some(100)), Some(100)),
        ((Some(-5), Some(100)), Some(0)),
        ((Some(0), Some(0)), None),
        ((None, Some(100)), None),
        ((Some(5), None), None),
    ];

    for ((value, maximum), expected) in cases {
        assert_eq!(compute_percent(value, maximum), expected, "{value:?}/{maximum:?}");
    }
}

#[test]
fn test_outcome_of_failure() {
    let outcome = ExecutionOutcome::Failed {
        error: "boom".into(),
    };
    assert!(outcome.is_failure());
    assert_eq!(outcome.status(), ExecutionStatus::Failed);
}
