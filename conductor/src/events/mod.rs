//! Domain events emitted at commit points of the application services.

pub mod notifier;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::constants::status::EVENT_CHANNEL_CAPACITY;
use crate::database::{JobStatus, MaintenanceMode, ObjectRef, TaskStatus};

pub use notifier::StatusNotifier;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Fields of an object changed; `changes` holds the new values
    ObjectUpdated {
        object: ObjectRef,
        changes: serde_json::Value,
    },
    TaskStatus {
        task_id: i64,
        object: ObjectRef,
        status: TaskStatus,
    },
    JobStatus {
        job_id: i64,
        task_id: i64,
        status: JobStatus,
    },
    /// Concerns that became visible or stopped being visible on `object`
    ConcernChanged {
        object: ObjectRef,
        added: Vec<i64>,
        removed: Vec<i64>,
    },
    MaintenanceModeChanged {
        object: ObjectRef,
        value: MaintenanceMode,
    },
    /// Hosts or the host-component mapping of a cluster changed
    TopologyChanged { cluster_id: i64 },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishing with no subscribers is not an error
    pub fn publish(&self, event: DomainEvent) {
        trace!("Publishing {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn object_updated(&self, object: ObjectRef, changes: serde_json::Value) {
        self.publish(DomainEvent::ObjectUpdated { object, changes });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.object_updated(ObjectRef::service(3), serde_json::json!({"state": "installed"}));

        match rx.recv().await.unwrap() {
            DomainEvent::ObjectUpdated { object, changes } => {
                assert_eq!(object, ObjectRef::service(3));
                assert_eq!(changes["state"], "installed");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(DomainEvent::TopologyChanged { cluster_id: 1 });
    }
}
