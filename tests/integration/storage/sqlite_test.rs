//! SQLite task store tests

use cadence::clock::{Clock, ManualClock};
use cadence::config::SchedulerConfig;
use cadence::models::{
    ClaimRequest, ClaimScope, ExecutionOutcome, ExecutionStatus, TaskDescriptor, TaskPriority,
};
use cadence::registry::{TaskError, TaskRegistry};
use cadence::scheduler::TaskScheduler;
use cadence::storage::{TaskStore, TaskStoreExt};
use cadence::SqliteStore;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub async fn create_sqlite_store() -> SqliteStore {
    let store = SqliteStore::in_memory()
        .await
        .expect("Failed to open SQLite database");
    store.migrate().await.expect("Failed to migrate");
    store
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
}

fn claim<'a>(task_id: i64, machine: &'a str, scope: ClaimScope<'a>) -> ClaimRequest<'a> {
    ClaimRequest {
        task_id,
        machine_name: machine,
        scope,
        due_slot: None,
        claimed_at: t0(),
    }
}

#[cfg(test)]
mod sqlite_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = create_sqlite_store().await;
        store.migrate().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_descriptor_roundtrip() {
        let store = create_sqlite_store().await;
        let task = TaskDescriptor::new("Digest", "mail.digest", "0 7 * * MON-FRI")
            .with_priority(TaskPriority::High)
            .per_machine()
            .stop_on_error()
            .with_next_run(t0() + Duration::microseconds(1_500));

        let inserted = store.insert_task(&task).await.unwrap();
        assert!(inserted.id > 0);

        let loaded = store.get_task(inserted.id).await.unwrap().unwrap();
        assert_eq!(loaded, inserted);

        let by_type = store.get_task_by_type("mail.digest").await.unwrap();
        assert_eq!(by_type.map(|t| t.id), Some(inserted.id));
    }

    #[tokio::test]
    async fn test_update_and_enable() {
        let store = create_sqlite_store().await;
        let mut task = store
            .insert_task(&TaskDescriptor::new("A", "a", "* * * * *").with_next_run(t0()))
            .await
            .unwrap();

        task.name = "Renamed".to_string();
        store.update_task(&task).await.unwrap();
        assert_eq!(store.get_task(task.id).await.unwrap().unwrap().name, "Renamed");

        store.set_enabled(task.id, false).await.unwrap();
        let disabled = store.get_task(task.id).await.unwrap().unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.next_run_utc, None);
        assert!(store.get_all_tasks(false).await.unwrap().is_empty());
        assert_eq!(store.get_all_tasks(true).await.unwrap().len(), 1);

        assert!(store.set_enabled(404, true).await.is_err());
        assert!(store.set_next_run(404, None).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_per_scope() {
        let store = create_sqlite_store().await;
        let global = store
            .insert_task(&TaskDescriptor::new("Global", "global", "* * * * *"))
            .await
            .unwrap();
        let local = store
            .insert_task(&TaskDescriptor::new("Local", "local", "* * * * *").per_machine())
            .await
            .unwrap();

        let first = store
            .try_claim(&claim(global.id, "web-1", ClaimScope::Global))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, ExecutionStatus::Claimed);
        assert_eq!(first.started_on_utc, t0());
        assert!(store
            .try_claim(&claim(global.id, "web-2", ClaimScope::Global))
            .await
            .unwrap()
            .is_none());

        assert!(store
            .try_claim(&claim(local.id, "web-1", ClaimScope::Machine("web-1")))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .try_claim(&claim(local.id, "web-2", ClaimScope::Machine("web-2")))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .try_claim(&claim(local.id, "web-2", ClaimScope::Machine("web-2")))
            .await
            .unwrap()
            .is_none());

        store
            .complete_run(first.id, &ExecutionOutcome::Succeeded, t0())
            .await
            .unwrap();
        assert!(store
            .try_claim(&claim(global.id, "web-2", ClaimScope::Global))
            .await
            .unwrap()
            .is_some());

        assert!(store
            .try_claim(&claim(404, "web-1", ClaimScope::Global))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_due_slot_guard() {
        let store = create_sqlite_store().await;
        let task = store
            .insert_task(&TaskDescriptor::new("A", "a", "*/5 * * * *"))
            .await
            .unwrap();

        let mut request = claim(task.id, "web-1", ClaimScope::Global);
        request.due_slot = Some(t0());
        request.claimed_at = t0() + Duration::seconds(2);
        let exec = store.try_claim(&request).await.unwrap().unwrap();
        store
            .complete_run(exec.id, &ExecutionOutcome::Succeeded, request.claimed_at)
            .await
            .unwrap();

        let mut late = claim(task.id, "web-2", ClaimScope::Global);
        late.due_slot = Some(t0());
        late.claimed_at = t0() + Duration::seconds(30);
        assert!(store.try_claim(&late).await.unwrap().is_none());

        late.due_slot = Some(t0() + Duration::minutes(5));
        late.claimed_at = t0() + Duration::minutes(5);
        assert!(store.try_claim(&late).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let store = create_sqlite_store().await;
        let task = store
            .insert_task(&TaskDescriptor::new("A", "a", "* * * * *"))
            .await
            .unwrap();
        let exec = store
            .try_claim(&claim(task.id, "web-1", ClaimScope::Global))
            .await
            .unwrap()
            .unwrap();

        assert!(!store.update_progress(exec.id, Some(5), None).await.unwrap());
        let started = t0() + Duration::seconds(1);
        assert!(store.start_run(exec.id, started).await.unwrap());
        assert!(store
            .update_progress(exec.id, Some(60), Some("Sent 60 of 100"))
            .await
            .unwrap());

        let finished = t0() + Duration::seconds(9);
        assert!(store
            .complete_run(exec.id, &ExecutionOutcome::Succeeded, finished)
            .await
            .unwrap());
        assert!(!store
            .complete_run(exec.id, &ExecutionOutcome::Cancelled, finished)
            .await
            .unwrap());

        let record = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert_eq!(record.started_on_utc, started);
        assert_eq!(record.finished_on_utc, Some(finished));
        assert_eq!(record.succeeded_on_utc, Some(finished));
        assert_eq!(record.error, None);
        assert_eq!(record.progress_percent, Some(60));
        assert_eq!(record.progress_message.as_deref(), Some("Sent 60 of 100"));
    }

    #[tokio::test]
    async fn test_history_abandon_and_trim() {
        let store = create_sqlite_store().await;
        let task = store
            .insert_task(&TaskDescriptor::new("A", "a", "* * * * *"))
            .await
            .unwrap();

        for i in 0..3 {
            let mut request = claim(task.id, "web-1", ClaimScope::Global);
            request.claimed_at = t0() + Duration::minutes(i);
            let exec = store.try_claim(&request).await.unwrap().unwrap();
            store
                .complete_run(exec.id, &ExecutionOutcome::Succeeded, request.claimed_at)
                .await
                .unwrap();
        }

        let mut stuck = claim(task.id, "web-2", ClaimScope::Global);
        stuck.claimed_at = t0() + Duration::minutes(3);
        let stuck = store.try_claim(&stuck).await.unwrap().unwrap();

        let history = store.get_execution_history(task.id, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, stuck.id);

        let last_web1 = store
            .get_last_execution(task.id, Some("web-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last_web1.started_on_utc, t0() + Duration::minutes(2));
        assert_eq!(store.get_running_executions(Some("web-2")).await.unwrap().len(), 1);

        // Only the newest record of the scope survives, and it is still running
        assert_eq!(store.trim_history(1, None).await.unwrap(), 3);
        assert_eq!(store.get_execution_history(task.id, 10).await.unwrap().len(), 1);

        assert_eq!(
            store
                .abandon_machine_runs("web-2", "restarted", t0() + Duration::minutes(4))
                .await
                .unwrap(),
            1
        );
        let abandoned = store.get_execution(stuck.id).await.unwrap().unwrap();
        assert_eq!(abandoned.status, ExecutionStatus::Failed);
        assert_eq!(abandoned.error.as_deref(), Some("restarted"));
        assert!(store.get_running_executions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_stale_runs() {
        let store = create_sqlite_store().await;
        let task = store
            .insert_task(&TaskDescriptor::new("A", "a", "* * * * *"))
            .await
            .unwrap();

        let mut old = claim(task.id, "web-1", ClaimScope::Global);
        old.claimed_at = t0() - Duration::hours(6);
        store.try_claim(&old).await.unwrap().unwrap();

        assert_eq!(
            store
                .abandon_stale_runs(t0() - Duration::hours(4), "stale", t0())
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .abandon_stale_runs(t0() - Duration::hours(4), "stale", t0())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_delete_cascades_to_history() {
        let store = create_sqlite_store().await;
        let task = store
            .insert_task(&TaskDescriptor::new("A", "a", "* * * * *"))
            .await
            .unwrap();
        let exec = store
            .try_claim(&claim(task.id, "web-1", ClaimScope::Global))
            .await
            .unwrap()
            .unwrap();

        assert!(store.delete_task(task.id).await.unwrap());
        assert!(store.get_execution(exec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduler_round_trip() {
        let store = create_sqlite_store().await;
        let clock = Arc::new(ManualClock::new(t0()));
        let registry = Arc::new(TaskRegistry::new());
        registry.register_fn("noop", |ctx, _| {
            Box::pin(async move {
                ctx.set_progress_percent(Some(100), Some("done"), true)
                    .await?;
                Ok::<_, TaskError>(())
            }) as Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>
        });

        let task = store
            .get_or_add_task(TaskDescriptor::new("Noop", "noop", "*/5 * * * *"), clock.now())
            .await
            .unwrap();

        let scheduler = TaskScheduler::with_clock(
            store.clone(),
            registry,
            SchedulerConfig {
                machine_name: "web-1".to_string(),
                self_poll: false,
                ..Default::default()
            },
            clock.clone() as Arc<dyn Clock>,
        );
        scheduler.initialize().await.unwrap();

        let report = scheduler.poll().await.unwrap();
        assert_eq!(report.dispatched.len(), 1);
        scheduler.wait_idle().await;

        let last = store.get_last_execution(task.id, None).await.unwrap().unwrap();
        assert_eq!(last.status, ExecutionStatus::Succeeded);
        assert_eq!(last.progress_percent, Some(100));
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().next_run_utc,
            Some(t0() + Duration::minutes(5))
        );
    }
}
