//! HTTP request handlers.
//!
//! - `common` - response envelope and error mapping
//! - `health` - liveness probe
//! - `plugin` - plugin callbacks from running jobs

pub mod common;
pub mod health;
pub mod plugin;

pub use health::*;
pub use plugin::*;
