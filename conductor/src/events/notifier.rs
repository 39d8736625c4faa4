// File: conductor/src/events/notifier.rs
//! Outbound status-server client.
//!
//! Subscribes to the event bus and forwards:
//! - object updates and task/job status to `event/`
//! - topology changes as a full `servicemap/` rewrite
//! - maintenance-mode changes as the `object/mm/` ON set

use anyhow::Result;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{DomainEvent, EventBus};
use crate::config::StatusConfig;
use crate::constants::status::REQUEST_TIMEOUT;
use crate::database::{Database, MaintenanceMode, ObjectType};

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct MaintenanceSet {
    pub services: Vec<i64>,
    pub components: Vec<i64>,
    pub hosts: Vec<i64>,
}

pub struct StatusNotifier {
    db: Arc<Database>,
    client: Client,
    base_url: String,
    token: String,
}

impl StatusNotifier {
    pub fn new(db: Arc<Database>, status: &StatusConfig) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            db,
            client,
            base_url: status.url.trim_end_matches('/').to_string(),
            token: status.secret_key.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    /// Forward events until the bus closes
    pub async fn run(self: Arc<Self>, bus: EventBus) {
        if !self.is_enabled() {
            info!("Status server URL not configured - notifications disabled");
            return;
        }
        let mut rx = bus.subscribe();
        info!("Status notifier started for {}", self.base_url);

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle(&event).await {
                        warn!("Status notification failed: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Status notifier lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Status notifier stopped");
    }

    pub async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::ObjectUpdated { object, changes } => {
                self.post(
                    "event/",
                    &json!({
                        "event": "update",
                        "object": {
                            "type": object.object_type,
                            "id": object.id,
                            "details": changes,
                        }
                    }),
                )
                .await
            }
            DomainEvent::TaskStatus {
                task_id,
                object,
                status,
            } => {
                self.post(
                    "event/",
                    &json!({
                        "event": "change_job_status",
                        "object": {
                            "type": "task",
                            "id": task_id,
                            "details": {"type": "status", "value": status.as_str(), "target": object},
                        }
                    }),
                )
                .await
            }
            DomainEvent::JobStatus {
                job_id,
                task_id,
                status,
            } => {
                self.post(
                    "event/",
                    &json!({
                        "event": "change_job_status",
                        "object": {
                            "type": "job",
                            "id": job_id,
                            "details": {"type": "status", "value": status.as_str(), "task_id": task_id},
                        }
                    }),
                )
                .await
            }
            DomainEvent::ConcernChanged { object, added, removed } => {
                self.post(
                    "event/",
                    &json!({
                        "event": "concerns_changed",
                        "object": {
                            "type": object.object_type,
                            "id": object.id,
                            "details": {"added": added, "removed": removed},
                        }
                    }),
                )
                .await
            }
            DomainEvent::MaintenanceModeChanged { .. } => {
                let set = self.maintenance_set().await?;
                self.post("object/mm/", &set).await
            }
            DomainEvent::TopologyChanged { .. } => {
                let map = self.servicemap().await?;
                self.post("servicemap/", &map).await
            }
        }
    }

    /// Ids of services, components and hosts with maintenance mode ON
    pub async fn maintenance_set(&self) -> Result<MaintenanceSet> {
        let mut set = MaintenanceSet::default();
        for (object_type, target) in [
            (ObjectType::Service, &mut set.services),
            (ObjectType::Component, &mut set.components),
            (ObjectType::Host, &mut set.hosts),
        ] {
            target.extend(
                self.db
                    .list_objects(object_type)
                    .await?
                    .into_iter()
                    .filter(|o| o.maintenance_mode == MaintenanceMode::On)
                    .map(|o| o.id),
            );
        }
        Ok(set)
    }

    /// Full cluster topology as the status server expects it
    pub async fn servicemap(&self) -> Result<Value> {
        let mut clusters: BTreeMap<i64, Vec<Value>> = BTreeMap::new();
        for (cluster_id, entry) in self.db.list_all_hostcomponents().await? {
            clusters.entry(cluster_id).or_default().push(json!({
                "host": entry.host_id,
                "service": entry.service_id,
                "component": entry.component_id,
            }));
        }
        let hosts: Vec<Value> = self
            .db
            .list_objects(ObjectType::Host)
            .await?
            .into_iter()
            .map(|h| json!({"id": h.id, "cluster": h.cluster_id, "maintenance_mode": h.maintenance_mode}))
            .collect();
        Ok(json!({"hostcomponent": clusters, "host": hosts}))
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, payload: &T) -> Result<()> {
        let url = format!("{}/{}", self.base_url, path);
        match timeout(
            REQUEST_TIMEOUT,
            self.client
                .post(&url)
                .header("Authorization", format!("Token {}", self.token))
                .json(payload)
                .send(),
        )
        .await
        {
            Ok(Ok(response)) => {
                if response.status().is_success() {
                    debug!("Posted status update to {}", url);
                } else {
                    warn!("Status server returned {} for {}", response.status(), url);
                }
            }
            Ok(Err(e)) => warn!("Failed to post status update to {}: {}", url, e),
            Err(_) => warn!("Status server timeout for {}", url),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ObjectRef;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn notifier(dir: &TempDir, url: &str) -> StatusNotifier {
        let db_path = dir.path().join("status.db").to_string_lossy().to_string();
        let db = Arc::new(Database::new(&db_path).await.unwrap());
        let status = StatusConfig {
            url: url.to_string(),
            secret_key: "s3cret".to_string(),
        };
        StatusNotifier::new(db, &status).unwrap()
    }

    #[tokio::test]
    async fn test_maintenance_change_posts_on_set() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/object/mm/"))
            .and(header("Authorization", "Token s3cret"))
            .and(body_json(json!({"services": [], "components": [], "hosts": []})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let notifier = notifier(&dir, &format!("{}/", server.uri())).await;
        assert!(notifier.is_enabled());
        notifier
            .handle(&DomainEvent::MaintenanceModeChanged {
                object: ObjectRef::host(1),
                value: MaintenanceMode::On,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_are_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servicemap/"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let notifier = notifier(&dir, &server.uri()).await;
        let result = notifier
            .handle(&DomainEvent::TopologyChanged { cluster_id: 1 })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_empty_url_disables_notifier() {
        let dir = TempDir::new().unwrap();
        assert!(!notifier(&dir, "").await.is_enabled());
    }
}
