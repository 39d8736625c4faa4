// File: conductor/src/main.rs
use anyhow::Result;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use conductor::constants::bundles::{BUNDLE_CONFIG_FILE, INCOMING_DIR};
use conductor::scheduler::ConfigRotation;
use conductor::web::start_web_server;
use conductor::{App, ConfigManager};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("conductor=info".parse()?)
        .add_directive("tower_http=warn".parse()?)
        .add_directive("tokio_cron_scheduler=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting cluster conductor");

    let config_dir = std::env::var("CONDUCTOR_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config_manager = ConfigManager::new(config_dir).await?;
    let config = config_manager.get_current_config();

    let app = App::build(config.clone()).await?;
    info!("Services initialized");

    install_incoming_bundles(&app).await;

    let recovered = app.scheduler.recover_stale().await?;
    if recovered > 0 {
        warn!("{} tasks from a previous run were marked BROKEN", recovered);
    }

    let rotation = ConfigRotation::new(app.db.clone(), config.config_rotation.clone()).await?;
    if let Err(e) = rotation.start().await {
        error!("ConfigLog rotation not started: {}", e);
    }

    tokio::spawn(app.notifier.clone().run(app.events.clone()));
    let _scheduler = app.scheduler.clone().start();
    let _supervisor = app.scheduler.clone().start_supervisor();
    info!("Task scheduler and supervisor started");

    start_web_server(app.web_state()).await
}

/// Load every bundle unpacked below `<stack_dir>/incoming`
async fn install_incoming_bundles(app: &App) {
    let dirs = &app.settings.dirs;
    let pattern = dirs
        .stack_dir
        .join(INCOMING_DIR)
        .join("*")
        .join(BUNDLE_CONFIG_FILE);
    let entries = match glob::glob(&pattern.to_string_lossy()) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Invalid bundle pattern {}: {}", pattern.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let Some(bundle_dir) = entry.parent().map(Path::to_path_buf) else {
            continue;
        };
        match app.catalog.install_dir(&bundle_dir, dirs).await {
            Ok(bundle_id) => info!("Bundle {} available as #{}", bundle_dir.display(), bundle_id),
            Err(e) => error!("Bundle {} rejected: {:#}", bundle_dir.display(), e),
        }
    }
}
