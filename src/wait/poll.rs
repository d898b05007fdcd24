//! Shared polling loop for every single-condition strategy.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{StrategyTarget, WaitContext};
use crate::error::{Result, TestbedError};

/// Outcome of one readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Probe {
    Ready,
    /// Not ready yet; the reason is kept for the timeout report
    NotReady(String),
}

/// One readiness check, attempted repeatedly by [`poll_until_ready`].
///
/// Returning `Err` stops polling immediately; use `Probe::NotReady` for
/// conditions that may still clear up.
#[async_trait]
pub(crate) trait Prober: Send {
    async fn probe(&mut self, target: &dyn StrategyTarget) -> Result<Probe>;
}

#[derive(Debug, Clone)]
pub(crate) struct PollSettings {
    pub strategy: String,
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    /// Resolve per-strategy overrides against the configured defaults
    pub fn resolve(
        strategy: String,
        timeout: Option<Duration>,
        interval: Option<Duration>,
        ctx: &WaitContext,
    ) -> Self {
        let minimum = ctx.defaults.min_poll_interval();
        let mut interval = interval.unwrap_or_else(|| ctx.defaults.poll_interval());
        if interval < minimum {
            warn!(
                strategy = %strategy,
                requested_ms = interval.as_millis() as u64,
                clamped_ms = minimum.as_millis() as u64,
                "⚠️ WAIT: poll interval below minimum, clamping"
            );
            interval = minimum;
        }

        Self {
            timeout: timeout.unwrap_or_else(|| ctx.defaults.startup_timeout()),
            strategy,
            interval,
        }
    }
}

/// Stand-in deadline for timeouts too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Probe until ready, the timeout elapses, or the token is cancelled.
///
/// The probe call itself is raced against the deadline and the token so a
/// hung connection cannot outlive the budget.
pub(crate) async fn poll_until_ready(
    settings: &PollSettings,
    target: &dyn StrategyTarget,
    cancellation: &CancellationToken,
    prober: &mut dyn Prober,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started
        .checked_add(settings.timeout)
        .unwrap_or_else(|| started + FAR_FUTURE);
    let mut last_observation = String::from("no probe completed");
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return Err(TestbedError::cancelled(format!("waiting for {}", settings.strategy)));
            }
            _ = tokio::time::sleep_until(deadline) => None,
            outcome = prober.probe(target) => Some(outcome),
        };

        match outcome {
            Some(Ok(Probe::Ready)) => {
                debug!(
                    strategy = %settings.strategy,
                    attempts = attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "✅ WAIT: ready"
                );
                return Ok(());
            }
            Some(Ok(Probe::NotReady(reason))) => last_observation = reason,
            Some(Err(error)) => return Err(error),
            None => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TestbedError::ReadinessTimeout {
                strategy: settings.strategy.clone(),
                elapsed: now.duration_since(started),
                last_observation,
            });
        }

        let next_poll = now
            .checked_add(settings.interval)
            .map_or(deadline, |next| next.min(deadline));
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return Err(TestbedError::cancelled(format!("waiting for {}", settings.strategy)));
            }
            _ = tokio::time::sleep_until(next_poll) => {}
        }
    }
}

/// Resolve `host:port`. Resolution failure is a transport error, never "not ready".
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TestbedError::transport(format!("resolve {host}"), e))?;
    addrs
        .next()
        .ok_or_else(|| TestbedError::transport(format!("resolve {host}"), "no addresses returned"))
}
