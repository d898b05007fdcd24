//! Per-batch launch options, resolved against [`LauncherConfig`] defaults.

use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::LauncherConfig;
use crate::error::{Result, TestbedError};

/// Options for one `launch` or `launch_all` call.
///
/// Unset fields fall back to the launcher configuration.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    timeout: Option<Duration>,
    max_concurrency: Option<usize>,
    cancellation: Option<CancellationToken>,
    cleanup_failed_instances: Option<bool>,
}

impl LaunchOptions {
    pub fn builder() -> LaunchOptionsBuilder {
        LaunchOptionsBuilder::default()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub(crate) fn resolve(&self, config: &LauncherConfig) -> ResolvedOptions {
        ResolvedOptions {
            timeout: self.timeout.or_else(|| config.default_timeout()),
            max_concurrency: self.max_concurrency.or(config.max_concurrency),
            cleanup_failed_instances: self
                .cleanup_failed_instances
                .unwrap_or(config.cleanup_failed_instances),
            cancellation: self.cancellation.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LaunchOptionsBuilder {
    options: LaunchOptions,
}

impl LaunchOptionsBuilder {
    /// Abandon every in-flight launch once `timeout` has elapsed
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Run at most `limit` launches at the same time
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.options.max_concurrency = Some(limit);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.options.cancellation = Some(token);
        self
    }

    pub fn cleanup_failed_instances(mut self, cleanup: bool) -> Self {
        self.options.cleanup_failed_instances = Some(cleanup);
        self
    }

    pub fn build(self) -> Result<LaunchOptions> {
        if self.options.timeout == Some(Duration::ZERO) {
            return Err(TestbedError::configuration(
                "launch timeout must be greater than zero",
            ));
        }
        if self.options.max_concurrency == Some(0) {
            return Err(TestbedError::configuration(
                "max_concurrency must be at least 1",
            ));
        }
        if let Some(limit) = self
            .options
            .max_concurrency
            .filter(|limit| *limit > Semaphore::MAX_PERMITS)
        {
            return Err(TestbedError::configuration(format!(
                "max_concurrency {limit} exceeds the supported maximum of {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(self.options)
    }
}

/// Options with configuration defaults applied
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub cleanup_failed_instances: bool,
    pub cancellation: CancellationToken,
}
