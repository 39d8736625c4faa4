//! Model-wide properties checked after realistic sequences of operations

mod common;

use std::collections::{BTreeSet, HashMap};

use common::fixtures::*;
use conductor::database::{ConcernType, ObjectRef};
use conductor::errors::error_code;
use conductor::services::LaunchRequest;

#[tokio::test]
async fn test_mapping_entries_stay_inside_one_cluster() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1", "h2"]).await;
    t.map(
        c.cluster.id,
        &[(c.hosts[0].id, c.component.id), (c.hosts[1].id, c.component.id)],
    )
    .await;
    t.map(c.cluster.id, &[(c.hosts[1].id, c.component.id)]).await;

    let entries = t.app.db.list_all_hostcomponents().await.unwrap();
    assert_eq!(entries.len(), 1);
    for (cluster_id, entry) in entries {
        for object in [
            ObjectRef::host(entry.host_id),
            ObjectRef::service(entry.service_id),
            ObjectRef::component(entry.component_id),
        ] {
            assert_eq!(t.object(object).await.cluster_id, Some(cluster_id));
        }
    }
}

#[tokio::test]
async fn test_one_issue_per_cause() {
    let t = TestApp::new(CONFIG_ISSUE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1", "h2"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;
    t.app.concerns.refresh_cluster(c.cluster.id).await.unwrap();
    t.app.concerns.refresh_object(c.service_ref()).await.unwrap();

    let mut counts: HashMap<(ObjectRef, String), usize> = HashMap::new();
    for concern in t.app.db.list_all_concerns().await.unwrap() {
        if concern.concern_type != ConcernType::Issue {
            continue;
        }
        let cause = concern.cause.map(|c| c.as_str().to_string()).unwrap_or_default();
        *counts.entry((concern.owner, cause)).or_default() += 1;
    }
    assert!(!counts.is_empty());
    assert!(counts.values().all(|n| *n == 1), "{:?}", counts);
}

#[tokio::test]
async fn test_lock_rejects_requests_on_related_objects() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;

    let noop = t.action_id(c.cluster_ref(), "noop").await;
    let task = t
        .app
        .actions
        .launch(&LaunchRequest::new(c.cluster_ref(), noop))
        .await
        .unwrap();

    for object in [
        c.cluster_ref(),
        c.service_ref(),
        c.component.object_ref(),
        c.hosts[0].object_ref(),
    ] {
        let err = t
            .app
            .concerns
            .check_not_blocked(object, None)
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), "TASK_ERROR", "{}", object);
    }
    t.app
        .concerns
        .check_not_blocked(c.cluster_ref(), Some(task.id))
        .await
        .unwrap();

    let desired = BTreeSet::from([(c.hosts[0].id, c.component.id)]);
    assert!(t
        .app
        .cluster
        .set_mapping(c.cluster.id, &desired, None)
        .await
        .is_err());

    t.run_task(task.id).await;
    for object in [c.cluster_ref(), c.hosts[0].object_ref()] {
        t.app.concerns.check_not_blocked(object, None).await.unwrap();
    }
}

#[tokio::test]
async fn test_mapping_is_all_or_nothing() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;
    t.map(c.cluster.id, &[(c.hosts[0].id, c.component.id)]).await;
    let stray = t
        .app
        .cluster
        .create_host(c.provider.id, "stray", "")
        .await
        .unwrap();

    let before = t.app.db.get_hostcomponents(c.cluster.id).await.unwrap();
    let desired = BTreeSet::from([
        (c.hosts[0].id, c.component.id),
        (stray.id, c.component.id),
    ]);
    let err = t
        .app
        .cluster
        .set_mapping(c.cluster.id, &desired, None)
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "FOREIGN_HOST");
    assert_eq!(t.app.db.get_hostcomponents(c.cluster.id).await.unwrap(), before);

    t.app
        .cluster
        .add_host_to_cluster(c.cluster.id, stray.id, None)
        .await
        .unwrap();
    t.app
        .cluster
        .set_mapping(c.cluster.id, &desired, None)
        .await
        .unwrap();
    let after: BTreeSet<(i64, i64)> = t
        .app
        .db
        .get_hostcomponents(c.cluster.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.host_id, e.component_id))
        .collect();
    assert_eq!(after, desired);
}

#[tokio::test]
async fn test_effective_config_round_trip() {
    let t = TestApp::new(CONFIGURED_BUNDLE).await;
    let c = t.cluster_with("svc", &[]).await;

    let effective = t
        .app
        .config
        .get_effective_config(c.cluster_ref(), None)
        .await
        .unwrap();
    assert_eq!(effective["port"], 8080);
    assert_eq!(effective["tuning"]["threads"], 4);

    t.app
        .config
        .put_config(c.cluster_ref(), &effective, None, "round trip")
        .await
        .unwrap();
    let again = t
        .app
        .config
        .get_effective_config(c.cluster_ref(), None)
        .await
        .unwrap();
    assert_eq!(again, effective);
    assert_eq!(
        t.app
            .config
            .list_config_versions(c.cluster_ref())
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_raising_a_flag_twice_keeps_one() {
    let t = TestApp::new(BASE_BUNDLE).await;
    let c = t.cluster_with("svc", &["h1"]).await;

    for _ in 0..2 {
        for object in [c.cluster_ref(), c.service_ref()] {
            t.app
                .concerns
                .raise_flag(object, "outdated", "", false)
                .await
                .unwrap();
        }
    }

    for object in [c.cluster_ref(), c.service_ref()] {
        let flags: Vec<_> = t
            .app
            .db
            .list_concerns_owned_by(object)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.concern_type == ConcernType::Flag && c.name == "outdated")
            .collect();
        assert_eq!(flags.len(), 1, "{}", object);
    }
}
