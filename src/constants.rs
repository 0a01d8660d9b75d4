// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

/// Lease bookkeeping limits
pub mod lease {
    use std::time::Duration;

    /// Upper bound for a single lease period; longer requests are clamped
    pub const MAX_LEASE: Duration = Duration::from_millis(60_000);

    /// Length of the alphanumeric lease identifier handed to clients
    pub const GUID_LENGTH: usize = 64;

    /// Live leases a single user may hold at once
    pub const DEFAULT_MAX_LEASES_PER_USER: usize = 2;

    /// How often expired leases are swept
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
}

/// Recording store layout and quota enforcement
pub mod recording {
    /// Container extension of recording fragments
    pub const FRAGMENT_EXTENSION: &str = "mp4";

    /// strftime layout of the fragment name prefix (local time)
    pub const FRAGMENT_TIME_FORMAT: &str = "%Y-%m-%d--%H-%M-%S";

    /// Maximum deletions performed by one quota enforcement pass
    pub const QUOTA_MAX_ITERATIONS: usize = 100;

    pub const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;
}

/// Timing constants for the driver loop and graph lifecycle
pub mod timing {
    use std::time::Duration;

    /// Bounded wait for the graph to report its settled state
    pub const STATE_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

    /// Driver tick that drains graph events
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Upper bound on graph events handled per driver tick
    pub const MAX_EVENTS_PER_TICK: usize = 64;

    /// Wait for end-of-stream to reach the recording sink during shutdown
    pub const EOS_TIMEOUT: Duration = Duration::from_secs(2);

    /// Total budget for reaching the stopped state during shutdown
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Grace period for in-flight HTTP requests when listeners stop
    pub const LISTENER_GRACE: Duration = Duration::from_secs(1);

    /// Wait for a fan-out pad to go idle before it is unlinked
    pub const UNLINK_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Values used when neither the command line nor the config file sets an option
pub mod defaults {
    pub const CONFIG_FILE: &str = "pitv-config.toml";
    pub const USER_DB: &str = "usernames.txt";
    pub const TLS_CERT: &str = "server.crt";
    pub const TLS_KEY: &str = "server.key";
    pub const LISTEN: &str = "http://0.0.0.0:5000";
    pub const MOUNT_POINT: &str = "/camera";
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_PREFIX: &str = "pitv";
    pub const LOG_FILE_SUFFIX: &str = "log";
    /// Rotated log files kept in the log directory
    pub const LOG_FILES_KEPT: usize = 3;

    pub const VIDEO_WIDTH: u32 = 640;
    pub const VIDEO_HEIGHT: u32 = 640;
    pub const VIDEO_FPS_NUMERATOR: i32 = 20;
    pub const VIDEO_FPS_DENOMINATOR: i32 = 1;

    pub const RECORDING_PATH: &str = "recordings";
    pub const RECORDING_SEGMENT_SECS: u64 = 60 * 60;
    /// Recording quota in megabytes (32 GiB)
    pub const RECORDING_MAX_SIZE_MB: i64 = 32 * 1024;
}

/// Application information
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }

    /// Check if running inside a container (some camera stacks need host access)
    pub fn is_containerized() -> bool {
        std::path::Path::new("/.dockerenv").exists()
            || std::path::Path::new("/run/.containerenv").exists()
    }

    /// Human readable runtime description for the startup banner
    pub fn runtime_description() -> String {
        format!(
            "pitv-server {} ({} {}{})",
            version(),
            std::env::consts::OS,
            std::env::consts::ARCH,
            if is_containerized() {
                ", containerized"
            } else {
                ""
            }
        )
    }
}
