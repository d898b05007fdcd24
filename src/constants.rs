//! # System Constants
//!
//! Default timings and bounds shared by the readiness engine and the launcher.

use std::time::Duration;

/// Readiness polling defaults
pub mod wait {
    use super::Duration;

    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

    /// Poll intervals below this are clamped up
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub const DEFAULT_OCCURRENCE: usize = 1;
    pub const DEFAULT_SQL_QUERY: &str = "SELECT 1";
    pub const DEFAULT_HTTP_STATUS: u16 = 200;

    /// Upper bound for a single HTTP probe request
    pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Multiplexed log stream framing
pub mod log_frame {
    pub const HEADER_LEN: usize = 8;

    pub const STREAM_STDIN: u8 = 0;
    pub const STREAM_STDOUT: u8 = 1;
    pub const STREAM_STDERR: u8 = 2;
}

/// Instance request defaults
pub mod request {
    pub const DEFAULT_FILE_MODE: u32 = 0o644;
    pub const DEFAULT_PROTOCOL: &str = "tcp";
    pub const LABEL_REUSE_NAME: &str = "org.testbed.reuse-name";
    pub const LABEL_SESSION: &str = "org.testbed.session-id";
}

/// Host used when the runtime does not report one
pub const DEFAULT_HOST: &str = "localhost";

pub const ENV_TESTBED_ENV: &str = "TESTBED_ENV";
pub const ENV_CONFIG_DIR: &str = "TESTBED_CONFIG_DIR";
pub const ENV_LOG_FORMAT: &str = "TESTBED_LOG_FORMAT";
pub const CONFIG_FILE_NAME: &str = "testbed-config.yaml";
