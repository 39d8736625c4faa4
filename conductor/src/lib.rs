pub mod advisory;
pub mod app;
pub mod catalog;
pub mod concerns;
pub mod config;
pub mod constants;
pub mod database;
pub mod effects;
pub mod errors;
pub mod events;
pub mod executor;
pub mod inventory;
pub mod params;
pub mod planner;
pub mod plugin;
pub mod scheduler;
pub mod services;
pub mod topology;
pub mod web;

// Re-export commonly used types
pub use app::App;
pub use config::{Config, ConfigManager};
pub use database::Database;
pub use errors::ConductorError;
pub use scheduler::TaskScheduler;
