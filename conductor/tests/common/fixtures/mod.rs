//! This module provides reusable test utilities:
//! - Bundle definitions installed from temp dirs
//! - A scripted job executor
//! - A fully wired service graph over a temp SQLite file

// Each test binary uses a different subset of the fixtures
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod bundles;
pub mod executor;
pub mod harness;

pub use bundles::*;
pub use executor::ScriptedExecutor;
pub use harness::{TestApp, TestCluster};
