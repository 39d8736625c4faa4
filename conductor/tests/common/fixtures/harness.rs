//! Wired service graph over a temp directory

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use conductor::catalog::definition::PrototypeType;
use conductor::config::{Config, DirsConfig};
use conductor::database::{ObjectRecord, ObjectRef, ObjectType, TaskRecord};
use conductor::App;

use super::bundles::PLAYBOOKS;
use super::executor::ScriptedExecutor;

/// Cluster `Test` with one service, its first component and attached hosts
pub struct TestCluster {
    pub cluster: ObjectRecord,
    pub service: ObjectRecord,
    pub component: ObjectRecord,
    pub provider: ObjectRecord,
    pub hosts: Vec<ObjectRecord>,
}

impl TestCluster {
    pub fn cluster_ref(&self) -> ObjectRef {
        self.cluster.object_ref()
    }

    pub fn service_ref(&self) -> ObjectRef {
        self.service.object_ref()
    }
}

pub struct TestApp {
    pub app: App,
    pub executor: Arc<ScriptedExecutor>,
    pub bundle_id: i64,
    pub dir: TempDir,
}

pub fn test_settings(root: &std::path::Path) -> Config {
    Config {
        database_path: root.join("conductor.db").display().to_string(),
        dirs: DirsConfig {
            run_dir: root.join("run"),
            stack_dir: root.join("stack"),
            tmp_dir: root.join("tmp"),
        },
        secret_key: "integration-secret".to_string(),
        ..Config::default()
    }
}

/// Unpacked bundle dir: `config.yaml` plus the playbooks it references
pub async fn write_bundle(root: &std::path::Path, yaml: &str) -> PathBuf {
    let source = root.join("upload");
    tokio::fs::create_dir_all(source.join("playbooks")).await.unwrap();
    tokio::fs::write(source.join("config.yaml"), yaml).await.unwrap();
    for playbook in PLAYBOOKS {
        tokio::fs::write(source.join("playbooks").join(playbook), "- hosts: all\n")
            .await
            .unwrap();
    }
    source
}

impl TestApp {
    pub async fn new(bundle_yaml: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = Arc::new(test_settings(dir.path()));
        let executor = Arc::new(ScriptedExecutor::new());
        let app = App::builder()
            .executor(executor.clone())
            .build(settings.clone())
            .await
            .expect("Failed to build app");

        let source = write_bundle(dir.path(), bundle_yaml).await;
        let bundle_id = app
            .catalog
            .install_dir(&source, &settings.dirs)
            .await
            .expect("Failed to install bundle");

        Self {
            app,
            executor,
            bundle_id,
            dir,
        }
    }

    pub async fn prototype_id(&self, kind: PrototypeType, name: &str, parent: Option<&str>) -> i64 {
        self.app
            .catalog
            .get_prototype(self.bundle_id, kind, name, parent)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("prototype {} {} not in bundle", kind, name))
            .id
    }

    pub async fn action_id(&self, object: ObjectRef, name: &str) -> i64 {
        let record = self.app.db.require_object(object).await.unwrap();
        self.app
            .catalog
            .find_action(record.prototype_id, name)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no action {} on {}", name, object))
            .id
    }

    pub async fn provider_with_hosts(&self, fqdns: &[&str]) -> (ObjectRecord, Vec<ObjectRecord>) {
        let provider_proto = self.prototype_id(PrototypeType::Provider, "P", None).await;
        let provider = self
            .app
            .cluster
            .create_provider(provider_proto, "P1", "")
            .await
            .unwrap();
        let mut hosts = Vec::new();
        for fqdn in fqdns {
            hosts.push(self.app.cluster.create_host(provider.id, fqdn, "").await.unwrap());
        }
        (provider, hosts)
    }

    /// Cluster `Test` with `service` added and `fqdns` attached, no mapping
    pub async fn cluster_with(&self, service: &str, fqdns: &[&str]) -> TestCluster {
        let cluster_proto = self.prototype_id(PrototypeType::Cluster, "C", None).await;
        let cluster = self
            .app
            .cluster
            .create_cluster(cluster_proto, "Test", "")
            .await
            .unwrap();
        let service_proto = self.prototype_id(PrototypeType::Service, service, None).await;
        let service = self.app.cluster.add_service(cluster.id, service_proto).await.unwrap();
        let component = self
            .app
            .db
            .list_children(ObjectType::Component, service.id)
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("service without components");

        let (provider, hosts) = self.provider_with_hosts(fqdns).await;
        for host in &hosts {
            self.app
                .cluster
                .add_host_to_cluster(cluster.id, host.id, None)
                .await
                .unwrap();
        }

        TestCluster {
            cluster,
            service,
            component,
            provider,
            hosts,
        }
    }

    pub async fn map(&self, cluster_id: i64, pairs: &[(i64, i64)]) {
        let desired: BTreeSet<(i64, i64)> = pairs.iter().copied().collect();
        self.app
            .cluster
            .set_mapping(cluster_id, &desired, None)
            .await
            .unwrap();
    }

    pub async fn object(&self, object: ObjectRef) -> ObjectRecord {
        self.app.db.require_object(object).await.unwrap()
    }

    pub async fn task(&self, task_id: i64) -> TaskRecord {
        self.app.db.get_task(task_id).await.unwrap().unwrap()
    }

    /// Advance the scheduler until `task_id` leaves CREATED
    pub async fn schedule(&self, task_id: i64) {
        for _ in 0..10 {
            match self.app.scheduler.tick().await.unwrap() {
                Some(id) if id == task_id => return,
                Some(_) => continue,
                None => break,
            }
        }
        panic!("task #{} was never scheduled", task_id);
    }

    pub async fn wait_terminal(&self, task_id: i64) -> TaskRecord {
        for _ in 0..250 {
            let task = self.task(task_id).await;
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task #{} did not finish", task_id);
    }

    /// Schedule and wait for a terminal status
    pub async fn run_task(&self, task_id: i64) -> TaskRecord {
        self.schedule(task_id).await;
        self.wait_terminal(task_id).await
    }
}
