//! # Testbed Configuration System
//!
//! YAML-backed defaults for the launcher and the readiness engine, with
//! environment-specific overrides (`development`, `test`, `production`).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use testbed_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let poll_interval = manager.config().wait.poll_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::constants;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring testbed-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestbedConfig {
    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub wait: WaitConfig,
}

/// Batch launch defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LauncherConfig {
    /// Global deadline for a whole batch, if any
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    /// Upper bound on concurrently launching requests, if any
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Terminate instances that were created but failed a later launch step
    #[serde(default = "default_true")]
    pub cleanup_failed_instances: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            max_concurrency: None,
            cleanup_failed_instances: true,
        }
    }
}

impl LauncherConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Readiness polling defaults applied to strategies that do not set their own
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WaitConfig {
    pub poll_interval_ms: u64,
    pub startup_timeout_ms: u64,
    pub min_poll_interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: constants::wait::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            startup_timeout_ms: constants::wait::DEFAULT_STARTUP_TIMEOUT.as_millis() as u64,
            min_poll_interval_ms: constants::wait::MIN_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }
}

fn default_true() -> bool {
    true
}

impl TestbedConfig {
    /// Validate the configuration, clamping recoverable values in place.
    ///
    /// Zero timeouts and zero concurrency are rejected; a poll interval below
    /// the configured minimum is raised to the minimum with a warning.
    pub fn validate(&mut self) -> ConfigResult<()> {
        if self.launcher.default_timeout_ms == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "launcher.default_timeout_ms",
                0,
                "batch timeout must be greater than zero",
            ));
        }

        if self.launcher.max_concurrency == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "launcher.max_concurrency",
                0,
                "concurrency bound must be at least 1",
            ));
        }

        if let Some(limit) = self
            .launcher
            .max_concurrency
            .filter(|limit| *limit > tokio::sync::Semaphore::MAX_PERMITS)
        {
            return Err(ConfigurationError::invalid_value(
                "launcher.max_concurrency",
                limit,
                "concurrency bound exceeds the supported maximum",
            ));
        }

        if self.wait.startup_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "wait.startup_timeout_ms",
                0,
                "startup timeout must be greater than zero",
            ));
        }

        if self.wait.poll_interval_ms < self.wait.min_poll_interval_ms {
            warn!(
                configured_ms = self.wait.poll_interval_ms,
                clamped_ms = self.wait.min_poll_interval_ms,
                "⚠️ CONFIG: poll interval below minimum, clamping"
            );
            self.wait.poll_interval_ms = self.wait.min_poll_interval_ms;
        }

        Ok(())
    }
}
