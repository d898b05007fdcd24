//! # Readiness Strategies
//!
//! A [`WaitStrategy`] is evaluated against a starting instance until the
//! instance is observably ready, the strategy's own timeout elapses, or the
//! caller cancels.
//!
//! ## Variants
//!
//! - **Log**: a substring or regex seen at least N times in the instance output
//! - **Listening port**: a TCP connection to the mapped port succeeds
//! - **HTTP**: a request to a path returns a matching status (and body)
//! - **Exec**: a command run inside the instance exits and answers as expected
//! - **SQL**: a database connection opens and a probe query succeeds
//! - **All**: every sub-strategy succeeds, evaluated in order
//!
//! ## Timeouts
//!
//! Every strategy carries its own startup timeout (falling back to
//! [`crate::config::WaitConfig`]). An all-of strategy runs its children one
//! after another, so its worst case is the sum of their timeouts unless an
//! overall deadline is set with [`AllStrategy::with_deadline`].
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use testbed_core::wait::{self, WaitStrategy};
//!
//! let strategy: WaitStrategy = wait::for_all(vec![
//!     wait::for_log("database system is ready to accept connections")
//!         .with_occurrence(2)
//!         .with_poll_interval(Duration::from_millis(100))
//!         .into(),
//!     wait::for_listening_port("5432/tcp").into(),
//! ])
//! .into();
//! ```

pub mod all;
pub mod exec;
pub mod http;
pub mod log;
pub(crate) mod poll;
pub mod port;
pub mod sql;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::config::WaitConfig;
use crate::error::{Result, TestbedError};
use crate::runtime::{ExecOutput, LogStream, PortSpec};

pub use all::AllStrategy;
pub use exec::ExecStrategy;
pub use http::HttpStrategy;
pub use log::{LogPattern, LogStrategy};
pub use port::PortStrategy;
pub use sql::{SqlDriver, SqlStrategy};

/// The view of a starting instance that strategies probe
#[async_trait]
pub trait StrategyTarget: Send + Sync + fmt::Debug {
    /// Ports the instance was asked to expose, in request order
    fn exposed_ports(&self) -> Vec<PortSpec>;

    async fn host(&self) -> Result<String>;

    async fn mapped_port(&self, port: &PortSpec) -> Result<u16>;

    /// All output written so far
    async fn logs(&self) -> Result<LogStream>;

    async fn exec(&self, command: &[String]) -> Result<ExecOutput>;
}

/// Defaults and cancellation shared by every strategy of one wait
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    pub defaults: WaitConfig,
    pub cancellation: CancellationToken,
}

impl WaitContext {
    pub fn new(defaults: WaitConfig, cancellation: CancellationToken) -> Self {
        Self {
            defaults,
            cancellation,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WaitStrategy {
    Log(LogStrategy),
    ListeningPort(PortStrategy),
    Http(HttpStrategy),
    Exec(ExecStrategy),
    Sql(SqlStrategy),
    All(AllStrategy),
}

impl WaitStrategy {
    /// Block until `target` is ready according to this strategy.
    pub fn wait_until_ready<'a>(
        &'a self,
        target: &'a dyn StrategyTarget,
        ctx: &'a WaitContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.validate()?;
            if ctx.cancellation.is_cancelled() {
                return Err(TestbedError::cancelled(format!("waiting for {self}")));
            }
            match self {
                WaitStrategy::Log(strategy) => strategy.wait_until_ready(target, ctx).await,
                WaitStrategy::ListeningPort(strategy) => strategy.wait_until_ready(target, ctx).await,
                WaitStrategy::Http(strategy) => strategy.wait_until_ready(target, ctx).await,
                WaitStrategy::Exec(strategy) => strategy.wait_until_ready(target, ctx).await,
                WaitStrategy::Sql(strategy) => strategy.wait_until_ready(target, ctx).await,
                WaitStrategy::All(strategy) => strategy.wait_until_ready(target, ctx).await,
            }
        })
    }

    /// Reject settings that can never succeed, before anything is launched
    pub fn validate(&self) -> Result<()> {
        match self {
            WaitStrategy::Log(strategy) => strategy.validate(),
            WaitStrategy::ListeningPort(strategy) => strategy.validate(),
            WaitStrategy::Http(strategy) => strategy.validate(),
            WaitStrategy::Exec(strategy) => strategy.validate(),
            WaitStrategy::Sql(strategy) => strategy.validate(),
            WaitStrategy::All(strategy) => strategy.validate(),
        }
    }

    /// Whether some part of this strategy probes the lowest exposed tcp port
    pub(crate) fn uses_first_exposed_port(&self) -> bool {
        match self {
            WaitStrategy::ListeningPort(strategy) => strategy.uses_first_exposed_port(),
            WaitStrategy::Http(strategy) => strategy.uses_first_exposed_port(),
            WaitStrategy::Sql(strategy) => strategy.uses_first_exposed_port(),
            WaitStrategy::All(strategy) => strategy
                .strategies()
                .iter()
                .any(WaitStrategy::uses_first_exposed_port),
            WaitStrategy::Log(_) | WaitStrategy::Exec(_) => false,
        }
    }
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStrategy::Log(strategy) => fmt::Display::fmt(strategy, f),
            WaitStrategy::ListeningPort(strategy) => fmt::Display::fmt(strategy, f),
            WaitStrategy::Http(strategy) => fmt::Display::fmt(strategy, f),
            WaitStrategy::Exec(strategy) => fmt::Display::fmt(strategy, f),
            WaitStrategy::Sql(strategy) => fmt::Display::fmt(strategy, f),
            WaitStrategy::All(strategy) => fmt::Display::fmt(strategy, f),
        }
    }
}

macro_rules! impl_from_strategy {
    ($($strategy:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$strategy> for WaitStrategy {
                fn from(strategy: $strategy) -> Self {
                    WaitStrategy::$variant(strategy)
                }
            }
        )*
    };
}

impl_from_strategy! {
    LogStrategy => Log,
    PortStrategy => ListeningPort,
    HttpStrategy => Http,
    ExecStrategy => Exec,
    SqlStrategy => Sql,
    AllStrategy => All,
}

/// Wait until `pattern` appears in the instance output
pub fn for_log(pattern: impl Into<String>) -> LogStrategy {
    LogStrategy::new(pattern)
}

/// Wait until a TCP connection to the mapped `port` succeeds.
///
/// An unparseable port spec is reported when the strategy is validated.
pub fn for_listening_port(port: &str) -> PortStrategy {
    PortStrategy::from_spec(port)
}

/// Wait until the first exposed port accepts TCP connections
pub fn for_exposed_port() -> PortStrategy {
    PortStrategy::first_exposed()
}

pub fn for_http(path: impl Into<String>) -> HttpStrategy {
    HttpStrategy::new(path)
}

pub fn for_exec<S: Into<String>>(command: impl IntoIterator<Item = S>) -> ExecStrategy {
    ExecStrategy::new(command)
}

pub fn for_sql<F>(port: &str, driver: SqlDriver, url: F) -> SqlStrategy
where
    F: Fn(&str, u16) -> String + Send + Sync + 'static,
{
    SqlStrategy::new(port, driver, url)
}

pub fn for_all(strategies: Vec<WaitStrategy>) -> AllStrategy {
    AllStrategy::new(strategies)
}
