// File: conductor/src/web/mod.rs
//! HTTP surface: the plugin callback endpoint and the liveness probe.

pub mod handlers;
pub mod server;

pub use server::{create_router, start_web_server};

use std::sync::Arc;

use crate::config::Config;
use crate::database::Database;
use crate::plugin::PluginApi;
use crate::scheduler::TaskScheduler;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Arc<Database>,
    pub plugin: Arc<PluginApi>,
    pub scheduler: Arc<TaskScheduler>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        database: Arc<Database>,
        plugin: Arc<PluginApi>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            config,
            database,
            plugin,
            scheduler,
        }
    }
}
