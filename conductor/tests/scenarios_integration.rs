//! End-to-end scenarios over the full service graph
//!
//! Each test installs a bundle into a temp stack dir, builds a cluster and
//! drives tasks through the scheduler with a scripted executor.

mod common;

use serde_json::Value;
use std::collections::BTreeSet;

use common::fixtures::*;
use conductor::catalog::definition::PrototypeType;
use conductor::database::{ConcernCause, ConcernType, LogType, ObjectType, TaskStatus};
use conductor::errors::error_code;
use conductor::events::DomainEvent;
use conductor::plugin::{Operation, PluginCall};
use conductor::services::LaunchRequest;

#[tokio::test]
async fn test_happy_path_action() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;
    let state_before = t.object(c.cluster_ref()).await.state;

    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Created);

    let done = t.run_task(task.id).await;
    assert_eq!(done.status, TaskStatus::Success);

    assert!(t.app.concerns.concerns_on(c.cluster_ref()).await.unwrap().is_empty());
    assert_eq!(t.object(c.cluster_ref()).await.state, state_before);

    let jobs = t.app.db.list_jobs(task.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let logs = t.app.db.list_logs(jobs[0].id).await.unwrap();
    let stdout: Vec<_> = logs.iter().filter(|l| l.log_type == LogType::Stdout).collect();
    assert_eq!(stdout.len(), 1);
}

#[tokio::test]
async fn test_config_issue_blocks_actions() {
    let t = TestApp::new(CONFIG_ISSUE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;

    let install = t.action_id(c.service_ref(), "install").await;
    let err = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.service_ref(), install))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "TASK_ERROR");
    assert!(err.to_string().contains("config"), "{}", err);

    let owned = t.app.db.list_concerns_owned_by(c.service_ref()).await.unwrap();
    let config_issues: Vec<_> = owned
        .iter()
        .filter(|c| c.concern_type == ConcernType::Issue && c.cause == Some(ConcernCause::Config))
        .collect();
    assert_eq!(config_issues.len(), 1);
    let issue_id = config_issues[0].id;

    for object in [c.cluster_ref(), c.hosts[0].object_ref(), c.service_ref()] {
        let visible = t.app.concerns.concerns_on(object).await.unwrap();
        assert!(
            visible.iter().any(|concern| concern.id == issue_id),
            "issue not visible on {}",
            object
        );
    }
}

#[tokio::test]
async fn test_hc_delta_reaches_inventory() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1", "h2"]).await;
    let (h1, h2) = (c.hosts[0].id, c.hosts[1].id);
    t.map(c.cluster.id, &[(h1, c.component.id)]).await;

    let expand = t.action_id(c.cluster_ref(), "expand").await;
    let request = LaunchRequest::new(c.cluster_ref(), expand)
        .with_hostcomponent([(h1, c.component.id), (h2, c.component.id)]);
    let task = t.app.actions.launch(&request).await.unwrap();
    let done = t.run_task(task.id).await;
    assert_eq!(done.status, TaskStatus::Success);

    let prepared = t.executor.started();
    let inventory: Value = serde_json::from_str(
        &tokio::fs::read_to_string(prepared[0].work_dir.join("inventory.json"))
            .await
            .unwrap(),
    )
    .unwrap();
    let groups = &inventory["all"]["children"];
    let hosts_of = |group: &str| -> BTreeSet<String> {
        groups[group]["hosts"]
            .as_object()
            .unwrap_or_else(|| panic!("no group {}", group))
            .keys()
            .cloned()
            .collect()
    };
    assert_eq!(hosts_of("svc.cmp.add"), BTreeSet::from(["h2".to_string()]));
    assert_eq!(
        hosts_of("svc.cmp"),
        BTreeSet::from(["h1".to_string(), "h2".to_string()])
    );

    let persisted: BTreeSet<(i64, i64)> = t
        .app
        .db
        .get_hostcomponents(c.cluster.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.host_id, e.component_id))
        .collect();
    assert_eq!(
        persisted,
        BTreeSet::from([(h1, c.component.id), (h2, c.component.id)])
    );
}

#[tokio::test]
async fn test_running_task_locks_related_objects() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;

    t.executor.hold();
    let long = t.action_id(c.cluster_ref(), "long").await;
    let a = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), long))
        .await
        .unwrap();
    t.schedule(a.id).await;
    t.executor.wait_started(1).await;
    assert_eq!(t.task(a.id).await.status, TaskStatus::Running);

    let install = t.action_id(c.service_ref(), "install").await;
    let err = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.service_ref(), install))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "TASK_ERROR");
    assert!(err.to_string().contains("long"), "{}", err);

    t.executor.release();
    assert_eq!(t.wait_terminal(a.id).await.status, TaskStatus::Success);

    let b = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.service_ref(), install))
        .await
        .unwrap();
    assert_eq!(t.run_task(b.id).await.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_plugin_state_change() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;

    t.executor.hold();
    let install = t.action_id(c.service_ref(), "install").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.service_ref(), install))
        .await
        .unwrap();
    t.schedule(task.id).await;
    let prepared = t.executor.wait_started(1).await;
    let job = &prepared[0].job;

    let mut events = t.app.events.subscribe();
    let result = t
        .app
        .plugin
        .handle(
            job.id,
            &job.token,
            PluginCall::SetState {
                target: Operation::Service { service_name: None },
                state: "installed".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(result.changed);

    t.executor.release();
    assert_eq!(t.wait_terminal(task.id).await.status, TaskStatus::Success);
    assert_eq!(t.object(c.service_ref()).await.state, "installed");

    let mut seen = false;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::ObjectUpdated { object, changes } = event {
            if object == c.service_ref() && changes["state"] == "installed" {
                seen = true;
            }
        }
    }
    assert!(seen, "no object update carrying the new state");
}

#[tokio::test]
async fn test_bound_to_violation() {
    let t = TestApp::new(BOUND_BUNDLE).await;
    let c = t.cluster_with("db", &["h3"]).await;
    let svc_proto = t.prototype_id(PrototypeType::Service, "svc", None).await;
    let svc = t.app.cluster.add_service(c.cluster.id, svc_proto).await.unwrap();
    let agent = t
        .app
        .db
        .list_children(ObjectType::Component, svc.id)
        .await
        .unwrap()
        .into_iter()
        .find(|component| component.name == "agent")
        .unwrap();

    let desired = BTreeSet::from([(c.hosts[0].id, agent.id)]);
    let err = t
        .app
        .cluster
        .set_mapping(c.cluster.id, &desired, None)
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "BIND_ERROR");
    let text = err.to_string();
    assert!(text.contains("h3"), "{}", text);
    assert!(text.contains("master"), "{}", text);
    assert!(t.app.db.get_hostcomponents(c.cluster.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_required_service() {
    let t = TestApp::new(REQUIRES_BUNDLE).await;
    let c = t.cluster_with("app", &["h1"]).await;

    let app_proto = t.prototype_id(PrototypeType::Service, "app", None).await;
    let requires = t.app.catalog.list_requires(app_proto).await.unwrap();
    assert_eq!(requires.len(), 1);
    assert_eq!(requires[0].service, "db");

    let requirement_issues = |owned: Vec<conductor::database::ConcernRecord>| {
        owned
            .into_iter()
            .filter(|c| c.cause == Some(ConcernCause::Requirement))
            .count()
    };
    let owned = t.app.db.list_concerns_owned_by(c.service_ref()).await.unwrap();
    assert_eq!(requirement_issues(owned), 1);

    let desired = BTreeSet::from([(c.hosts[0].id, c.component.id)]);
    let err = t
        .app
        .cluster
        .set_mapping(c.cluster.id, &desired, None)
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "REQUIRES_ERROR");

    let db_proto = t.prototype_id(PrototypeType::Service, "db", None).await;
    t.app.cluster.add_service(c.cluster.id, db_proto).await.unwrap();
    let owned = t.app.db.list_concerns_owned_by(c.service_ref()).await.unwrap();
    assert_eq!(requirement_issues(owned), 0);
    t.app
        .cluster
        .set_mapping(c.cluster.id, &desired, None)
        .await
        .unwrap();
}
