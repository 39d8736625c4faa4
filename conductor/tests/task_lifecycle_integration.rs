//! Task cancellation, failure handling and liveness supervision

mod common;

use common::fixtures::*;
use conductor::database::{ConcernType, JobStatus, TaskStatus};
use conductor::errors::error_code;
use conductor::executor::JobOutcome;
use conductor::services::LaunchRequest;

async fn locks_of(t: &TestApp, task_id: i64) -> usize {
    t.app
        .db
        .list_task_locks(task_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.concern_type == ConcernType::Lock)
        .count()
}

#[tokio::test]
async fn test_cancel_created_task_revokes() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();
    assert_eq!(locks_of(&t, task.id).await, 1);

    let status = t.app.actions.cancel(task.id, "admin").await.unwrap();
    assert_eq!(status, TaskStatus::Revoked);
    assert_eq!(t.task(task.id).await.status, TaskStatus::Revoked);
    assert_eq!(locks_of(&t, task.id).await, 0);
    assert_eq!(t.app.scheduler.tick().await.unwrap(), None);

    let err = t.app.actions.cancel(task.id, "admin").await.unwrap_err();
    assert_eq!(error_code(&err), "NOT_ALLOWED_TERMINATION");
}

#[tokio::test]
async fn test_terminate_running_task() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.executor.hold();

    let long = t.action_id(c.cluster_ref(), "long").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), long))
        .await
        .unwrap();
    t.schedule(task.id).await;
    t.executor.wait_started(1).await;

    let status = t.app.actions.cancel(task.id, "admin").await.unwrap();
    assert_eq!(status, TaskStatus::Aborted);

    let done = t.wait_terminal(task.id).await;
    assert_eq!(done.status, TaskStatus::Aborted);
    assert_eq!(locks_of(&t, task.id).await, 0);
    let jobs = t.app.db.list_jobs(task.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Aborted);
}

#[tokio::test]
async fn test_action_without_terminate_permission() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.executor.hold();

    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();
    t.schedule(task.id).await;
    t.executor.wait_started(1).await;

    let err = t.app.actions.cancel(task.id, "admin").await.unwrap_err();
    assert_eq!(error_code(&err), "NOT_ALLOWED_TERMINATION");

    t.executor.release();
    assert_eq!(t.wait_terminal(task.id).await.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_failed_job_stops_task() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.executor.push_outcome(JobOutcome::failed(Some(2)));

    let two_steps = t.action_id(c.cluster_ref(), "two_steps").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), two_steps))
        .await
        .unwrap();
    let done = t.run_task(task.id).await;
    assert_eq!(done.status, TaskStatus::Failed);

    let jobs = t.app.db.list_jobs(task.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[1].status, JobStatus::Aborted);
    assert_eq!(t.executor.started().len(), 1);
    assert_eq!(locks_of(&t, task.id).await, 0);
}

#[tokio::test]
async fn test_job_start_dates_follow_order() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;

    let two_steps = t.action_id(c.cluster_ref(), "two_steps").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), two_steps))
        .await
        .unwrap();
    assert_eq!(t.run_task(task.id).await.status, TaskStatus::Success);

    let jobs = t.app.db.list_jobs(task.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Success));
    let first = jobs[0].start_date.unwrap();
    let second = jobs[1].start_date.unwrap();
    assert!(first <= second);
}

#[tokio::test]
async fn test_supervisor_fails_task_after_two_dead_passes() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.executor.hold();

    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();
    t.schedule(task.id).await;
    t.executor.wait_started(1).await;

    assert_eq!(t.app.scheduler.supervise().await.unwrap(), 0);
    t.executor.set_alive(false);
    assert_eq!(t.app.scheduler.supervise().await.unwrap(), 0);
    assert_eq!(t.app.scheduler.supervise().await.unwrap(), 1);

    assert_eq!(t.task(task.id).await.status, TaskStatus::Failed);
    assert_eq!(locks_of(&t, task.id).await, 0);
    assert!(t.app.scheduler.running_tasks().await.is_empty());
}

#[tokio::test]
async fn test_recover_stale_marks_orphans_broken() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();

    // RUNNING in the database with no runner behind it
    t.app
        .db
        .update_task_status(task.id, TaskStatus::Running)
        .await
        .unwrap();

    assert_eq!(t.app.scheduler.recover_stale().await.unwrap(), 1);
    assert_eq!(t.task(task.id).await.status, TaskStatus::Broken);
    assert!(t.app.db.list_task_locks(task.id).await.unwrap().is_empty());
    assert_eq!(t.app.scheduler.recover_stale().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failing_effect_finalises_task_once() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;

    // Record every state write and refuse the on_fail multi_state write
    let pool = t.app.db.pool();
    for ddl in [
        "CREATE TABLE state_writes (state TEXT NOT NULL)",
        "CREATE TRIGGER record_state_write AFTER UPDATE OF state ON objects \
         BEGIN INSERT INTO state_writes (state) VALUES (NEW.state); END",
        "CREATE TRIGGER refuse_repair_flag BEFORE UPDATE OF multi_state ON objects \
         WHEN NEW.multi_state LIKE '%needs_repair%' \
         BEGIN SELECT RAISE(ABORT, 'multi_state refused'); END",
    ] {
        sqlx::query(ddl).execute(pool).await.unwrap();
    }

    t.executor.push_outcome(JobOutcome::failed(Some(1)));
    let fragile = t.action_id(c.cluster_ref(), "fragile").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), fragile))
        .await
        .unwrap();

    let done = t.run_task(task.id).await;
    assert_eq!(done.status, TaskStatus::Broken);
    assert_eq!(locks_of(&t, task.id).await, 0);

    let (writes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM state_writes WHERE state = 'degraded'")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(writes, 1);

    // The cluster is free for the next action
    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let next = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();
    assert_eq!(t.run_task(next.id).await.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_racing_launches_admit_one_task() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let request = LaunchRequest::new(c.cluster_ref(), noop);

    for _ in 0..5 {
        let (first, second) = tokio::join!(
            t.app.actions.launch(&request),
            t.app.actions.launch(&request)
        );
        let (accepted, refused) = match (first, second) {
            (Ok(task), Err(e)) | (Err(e), Ok(task)) => (task, e),
            (Ok(_), Ok(_)) => panic!("both launches were accepted"),
            (Err(a), Err(b)) => panic!("both launches were refused: {:#} / {:#}", a, b),
        };
        assert_eq!(error_code(&refused), "TASK_ERROR");
        assert_eq!(locks_of(&t, accepted.id).await, 1);

        assert_eq!(t.run_task(accepted.id).await.status, TaskStatus::Success);
    }
}
