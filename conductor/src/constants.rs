//! Central repository for timeouts, intervals, and limits
//!
//! Constants are grouped by the subsystem that consumes them.

use std::time::Duration;

/// SQLite pool settings
pub mod database {
    pub const MAX_CONNECTIONS: u32 = 8;

    /// How long a writer waits for the SQLite lock before failing
    pub const BUSY_TIMEOUT_SECONDS: u64 = 30;
}

/// Remote runner client constants
pub mod http {
    use super::Duration;

    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Consecutive failed polls before the runner is considered gone
    pub const MAX_FAILED_POLLS: u32 = 3;
}

/// Status server client constants
pub mod status {
    use super::Duration;

    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Event bus capacity before slow subscribers start lagging
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
}

/// Job execution constants
pub mod jobs {
    use super::Duration;

    /// Grace period between SIGTERM-style kill request and giving up on a child
    pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

    pub const CONFIG_FILE: &str = "config.json";
    pub const INVENTORY_FILE: &str = "inventory.json";
    pub const SECRETS_DIR: &str = "secrets";

    /// Glob, relative to the job dir, for extra log files produced by scripts
    pub const CUSTOM_LOG_PATTERN: &str = "*.log";
}

/// Concern naming
pub mod concerns {
    pub const LOCK_NAME: &str = "lock";
}

/// Plugin callback constants
pub mod plugin {
    /// Flag raised by `change_flag` when the call names none
    pub const DEFAULT_FLAG_NAME: &str = "adcm_outdated_config";

    /// Name of the json log row `check` calls accumulate into
    pub const CHECK_LOG_NAME: &str = "check";
}

/// Bundle layout
pub mod bundles {
    /// Definition file at the root of an unpacked bundle
    pub const BUNDLE_CONFIG_FILE: &str = "config.yaml";

    /// Directory below `stack_dir` scanned for bundles at startup
    pub const INCOMING_DIR: &str = "incoming";
}
