//! Plugin callbacks through the HTTP router, made from a held job

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tower::ServiceExt;

use common::fixtures::*;
use conductor::database::{ConcernType, LogFormat, LogType, TaskStatus};
use conductor::executor::PreparedJob;
use conductor::services::LaunchRequest;
use conductor::web::create_router;

async fn post_call(t: &TestApp, job_id: i64, token: &str, body: Value) -> (StatusCode, Value) {
    let router = create_router(t.app.web_state());
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/plugin/{}", job_id))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Start the cluster's `noop` action and hold its job in RUNNING
async fn running_job(t: &TestApp, c: &TestCluster) -> (i64, PreparedJob) {
    t.executor.hold();
    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();
    t.schedule(task.id).await;
    let prepared = t.executor.wait_started(1).await;
    (task.id, prepared[0].clone())
}

#[tokio::test]
async fn test_set_config_by_parameter() {
    let t = TestApp::new(CONFIGURED_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let (task_id, prepared) = running_job(&t, &c).await;

    let (status, body) = post_call(
        &t,
        prepared.job.id,
        &prepared.job.token,
        json!({
            "call": "set_config",
            "target": {"type": "cluster"},
            "parameters": [{"key": "tuning/threads", "value": 8}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["changed"], true);

    let config = t
        .app
        .config
        .get_effective_config(c.cluster_ref(), None)
        .await
        .unwrap();
    assert_eq!(config["tuning"]["threads"], 8);
    assert_eq!(config["port"], 8080);

    t.executor.release();
    assert_eq!(t.wait_terminal(task_id).await.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let (task_id, prepared) = running_job(&t, &c).await;

    let (status, body) = post_call(
        &t,
        prepared.job.id,
        "not-the-token",
        json!({"call": "set_state", "target": {"type": "cluster"}, "state": "x"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_ERROR");
    assert_eq!(body["success"], false);
    assert_ne!(t.object(c.cluster_ref()).await.state, "x");

    t.executor.release();
    t.wait_terminal(task_id).await;
}

#[tokio::test]
async fn test_flag_raised_twice_is_one_flag() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let (task_id, prepared) = running_job(&t, &c).await;

    for _ in 0..2 {
        let (status, _) = post_call(
            &t,
            prepared.job.id,
            &prepared.job.token,
            json!({"call": "change_flag", "operation": "up", "msg": "restart needed"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let flags: Vec<_> = t
        .app
        .db
        .list_concerns_owned_by(c.cluster_ref())
        .await
        .unwrap()
        .into_iter()
        .filter(|concern| concern.concern_type == ConcernType::Flag)
        .collect();
    assert_eq!(flags.len(), 1);
    assert!(!flags[0].blocking);

    t.executor.release();
    t.wait_terminal(task_id).await;
}

#[tokio::test]
async fn test_checks_accumulate_in_one_log() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let (task_id, prepared) = running_job(&t, &c).await;

    for title in ["disk", "memory"] {
        let (status, body) = post_call(
            &t,
            prepared.job.id,
            &prepared.job.token,
            json!({"call": "check", "title": title, "result": true, "msg": "fine"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
    }

    let log = t
        .app
        .db
        .find_log(prepared.job.id, "check", LogType::Check)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.format, LogFormat::Json);
    let items: Value = serde_json::from_str(log.body.as_deref().unwrap()).unwrap();
    let titles: Vec<&str> = items
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["disk", "memory"]);

    t.executor.release();
    t.wait_terminal(task_id).await;
}

#[tokio::test]
async fn test_change_hc_updates_persisted_mapping_only() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1", "h2"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;
    let (task_id, prepared) = running_job(&t, &c).await;

    let (status, body) = post_call(
        &t,
        prepared.job.id,
        &prepared.job.token,
        json!({
            "call": "change_hc",
            "operations": [
                {"action": "add", "service": "svc", "component": "cmp", "host": "h2"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["changed"], true);

    let mapping: BTreeSet<(i64, i64)> = t
        .app
        .db
        .get_hostcomponents(c.cluster.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.host_id, e.component_id))
        .collect();
    assert_eq!(
        mapping,
        BTreeSet::from([
            (c.hosts[0].id, c.component.id),
            (c.hosts[1].id, c.component.id)
        ])
    );
    assert!(t.task(task_id).await.hostcomponent.is_none());

    t.executor.release();
    assert_eq!(t.wait_terminal(task_id).await.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_calls_after_job_end_are_refused() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    let (task_id, prepared) = running_job(&t, &c).await;
    t.executor.release();
    t.wait_terminal(task_id).await;

    let (status, body) = post_call(
        &t,
        prepared.job.id,
        &prepared.job.token,
        json!({"call": "set_state", "target": {"type": "cluster"}, "state": "late"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "PLUGIN_ERROR");
    assert_ne!(t.object(c.cluster_ref()).await.state, "late");
}
