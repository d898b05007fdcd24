//! Listening-port readiness: a TCP connect to the mapped port succeeds.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;

use super::poll::{poll_until_ready, resolve, PollSettings, Probe, Prober};
use super::{StrategyTarget, WaitContext};
use crate::error::{Result, TestbedError};
use crate::runtime::{PortSpec, Protocol};

/// Which instance port a strategy targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PortSelector {
    Spec(PortSpec),
    /// The lowest exposed TCP port of the instance
    FirstExposed,
    /// A spec that failed to parse; reported by `validate`
    Invalid(String),
}

impl PortSelector {
    pub(crate) fn parse(spec: &str) -> Self {
        match spec.parse::<PortSpec>() {
            Ok(port) => PortSelector::Spec(port),
            Err(_) => PortSelector::Invalid(spec.to_string()),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            PortSelector::Invalid(spec) => Err(TestbedError::configuration(format!(
                "invalid port spec '{spec}' in wait strategy"
            ))),
            PortSelector::Spec(port) if port.protocol != Protocol::Tcp => {
                Err(TestbedError::configuration(format!(
                    "only tcp ports can be probed, got {port}"
                )))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn select(&self, target: &dyn StrategyTarget) -> Result<PortSpec> {
        match self {
            PortSelector::Spec(port) => Ok(*port),
            PortSelector::FirstExposed => target
                .exposed_ports()
                .into_iter()
                .filter(|port| port.protocol == Protocol::Tcp)
                .min_by_key(|port| port.port)
                .ok_or_else(|| {
                    TestbedError::configuration("wait strategy needs a port but none is exposed")
                }),
            PortSelector::Invalid(spec) => Err(TestbedError::configuration(format!(
                "invalid port spec '{spec}' in wait strategy"
            ))),
        }
    }
}

impl fmt::Display for PortSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSelector::Spec(port) => write!(f, "{port}"),
            PortSelector::FirstExposed => write!(f, "first exposed port"),
            PortSelector::Invalid(spec) => write!(f, "invalid port '{spec}'"),
        }
    }
}

pub(crate) enum Location {
    Mapped { host: String, port: u16 },
    Pending(String),
}

/// Find the host and mapped port of `selector`.
///
/// A port that is not mapped yet is pending; a host that cannot be inspected
/// is an error.
pub(crate) async fn locate(target: &dyn StrategyTarget, selector: &PortSelector) -> Result<Location> {
    let port = selector.select(target)?;
    let host = target.host().await?;
    match target.mapped_port(&port).await {
        Ok(mapped) => Ok(Location::Mapped { host, port: mapped }),
        Err(e) => Ok(Location::Pending(format!("port {port} not mapped yet: {e}"))),
    }
}

#[derive(Debug, Clone)]
pub struct PortStrategy {
    port: PortSelector,
    poll_interval: Option<Duration>,
    startup_timeout: Option<Duration>,
}

impl PortStrategy {
    pub fn new(port: PortSpec) -> Self {
        Self::with_selector(PortSelector::Spec(port))
    }

    pub fn from_spec(spec: &str) -> Self {
        Self::with_selector(PortSelector::parse(spec))
    }

    pub fn first_exposed() -> Self {
        Self::with_selector(PortSelector::FirstExposed)
    }

    fn with_selector(port: PortSelector) -> Self {
        Self {
            port,
            poll_interval: None,
            startup_timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub(crate) fn uses_first_exposed_port(&self) -> bool {
        matches!(self.port, PortSelector::FirstExposed)
    }

    pub fn validate(&self) -> Result<()> {
        self.port.validate()
    }

    pub async fn wait_until_ready(&self, target: &dyn StrategyTarget, ctx: &WaitContext) -> Result<()> {
        let settings = PollSettings::resolve(
            self.to_string(),
            self.startup_timeout,
            self.poll_interval,
            ctx,
        );
        let mut prober = PortProber { selector: &self.port };
        poll_until_ready(&settings, target, &ctx.cancellation, &mut prober).await
    }
}

impl fmt::Display for PortStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listening port {}", self.port)
    }
}

struct PortProber<'a> {
    selector: &'a PortSelector,
}

#[async_trait]
impl Prober for PortProber<'_> {
    async fn probe(&mut self, target: &dyn StrategyTarget) -> Result<Probe> {
        let (host, port) = match locate(target, self.selector).await? {
            Location::Mapped { host, port } => (host, port),
            Location::Pending(reason) => return Ok(Probe::NotReady(reason)),
        };
        let addr = resolve(&host, port).await?;

        match TcpStream::connect(addr).await {
            Ok(_stream) => Ok(Probe::Ready),
            Err(e) => Ok(Probe::NotReady(format!("connect {addr}: {e}"))),
        }
    }
}
