// File: conductor/src/app.rs
//! Service graph construction shared by the binary and integration tests.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::concerns::ConcernService;
use crate::config::Config;
use crate::database::Database;
use crate::effects::EffectApplier;
use crate::events::{EventBus, StatusNotifier};
use crate::executor::{self, InternalScripts, JobExecutor, JobPreparer};
use crate::inventory::InventoryBuilder;
use crate::params::{ConfigService, FileStore, SecretCipher};
use crate::planner::ActionPlanner;
use crate::plugin::PluginApi;
use crate::scheduler::{TaskRunner, TaskScheduler};
use crate::services::{
    ActionService, AllowAll, AuditHook, Authorizer, ClusterService, TracingAudit, UpgradeService,
};
use crate::topology::TopologyService;
use crate::web::AppState;

/// Every long-lived service, wired once
pub struct App {
    pub settings: Arc<Config>,
    pub events: EventBus,
    pub db: Arc<Database>,
    pub catalog: Arc<Catalog>,
    pub config: Arc<ConfigService>,
    pub topology: Arc<TopologyService>,
    pub concerns: Arc<ConcernService>,
    pub effects: Arc<EffectApplier>,
    pub cluster: Arc<ClusterService>,
    pub upgrades: Arc<UpgradeService>,
    pub inventory: Arc<InventoryBuilder>,
    pub planner: Arc<ActionPlanner>,
    pub runner: Arc<TaskRunner>,
    pub scheduler: Arc<TaskScheduler>,
    pub actions: Arc<ActionService>,
    pub plugin: Arc<PluginApi>,
    pub notifier: Arc<StatusNotifier>,
}

/// Optional seams; anything left unset gets its default implementation
#[derive(Default)]
pub struct AppBuilder {
    executor: Option<Arc<dyn JobExecutor>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    audit: Option<Arc<dyn AuditHook>>,
}

impl AppBuilder {
    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditHook>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn build(self, settings: Arc<Config>) -> Result<App> {
        let events = EventBus::new();
        let db = Arc::new(Database::new(&settings.database_path).await?);
        let catalog = Arc::new(Catalog::new(db.clone()));

        let secret_key = if settings.secret_key.is_empty() {
            warn!("Using an ephemeral secret key; sealed passwords will not survive a restart");
            uuid::Uuid::new_v4().to_string()
        } else {
            settings.secret_key.clone()
        };
        let cipher = Arc::new(SecretCipher::new(&secret_key));
        let files = FileStore::new(settings.dirs.file_dir());
        let config = Arc::new(ConfigService::new(db.clone(), catalog.clone(), cipher, files));

        let topology = Arc::new(TopologyService::new(db.clone(), catalog.clone()));
        let concerns = Arc::new(ConcernService::new(
            db.clone(),
            catalog.clone(),
            config.clone(),
            topology.clone(),
            events.clone(),
        ));
        let effects = Arc::new(EffectApplier::new(
            db.clone(),
            catalog.clone(),
            topology.clone(),
            concerns.clone(),
            settings.maintenance_actions.clone(),
            events.clone(),
        ));
        let cluster = Arc::new(ClusterService::new(
            db.clone(),
            catalog.clone(),
            config.clone(),
            topology.clone(),
            concerns.clone(),
            events.clone(),
        ));
        let upgrades = Arc::new(UpgradeService::new(
            db.clone(),
            catalog.clone(),
            config.clone(),
            topology.clone(),
            concerns.clone(),
            events.clone(),
        ));
        let inventory = Arc::new(InventoryBuilder::new(
            db.clone(),
            catalog.clone(),
            config.clone(),
            topology.clone(),
        ));
        let planner = Arc::new(ActionPlanner::new(
            db.clone(),
            catalog.clone(),
            config.clone(),
            topology.clone(),
            concerns.clone(),
            upgrades.clone(),
            inventory.clone(),
            self.authorizer.unwrap_or_else(|| Arc::new(AllowAll)),
            settings.clone(),
            events.clone(),
        ));

        let executor = match self.executor {
            Some(executor) => executor,
            None => executor::from_config(&settings)?,
        };
        info!(
            "Job executor: {} ({})",
            executor.environment(),
            executor.worker_id()
        );
        let preparer = Arc::new(JobPreparer::new(
            db.clone(),
            catalog.clone(),
            config.clone(),
            inventory.clone(),
            settings.clone(),
        ));
        let internal = Arc::new(InternalScripts::new(
            db.clone(),
            catalog.clone(),
            topology.clone(),
            upgrades.clone(),
            events.clone(),
        ));
        let runner = Arc::new(TaskRunner::new(
            db.clone(),
            catalog.clone(),
            preparer,
            internal,
            executor,
            effects.clone(),
            events.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            db.clone(),
            catalog.clone(),
            planner.clone(),
            concerns.clone(),
            effects.clone(),
            runner.clone(),
            events.clone(),
            settings.scheduler.clone(),
        ));
        let actions = Arc::new(ActionService::new(
            db.clone(),
            catalog.clone(),
            planner.clone(),
            scheduler.clone(),
            upgrades.clone(),
            cluster.clone(),
            self.audit.unwrap_or_else(|| Arc::new(TracingAudit)),
            settings.maintenance_actions.clone(),
        ));
        let plugin = Arc::new(PluginApi::new(
            db.clone(),
            config.clone(),
            concerns.clone(),
            effects.clone(),
            cluster.clone(),
        ));
        let notifier = Arc::new(StatusNotifier::new(db.clone(), &settings.status)?);

        Ok(App {
            settings,
            events,
            db,
            catalog,
            config,
            topology,
            concerns,
            effects,
            cluster,
            upgrades,
            inventory,
            planner,
            runner,
            scheduler,
            actions,
            plugin,
            notifier,
        })
    }
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    /// Default seams, executor chosen by `executor.default_environment`
    pub async fn build(settings: Arc<Config>) -> Result<App> {
        AppBuilder::default().build(settings).await
    }

    pub fn web_state(&self) -> AppState {
        AppState::new(
            self.settings.clone(),
            self.db.clone(),
            self.plugin.clone(),
            self.scheduler.clone(),
        )
    }
}
