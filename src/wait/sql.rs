//! SQL readiness: a database connection opens and a probe query succeeds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::Connection;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::poll::{poll_until_ready, PollSettings, Probe, Prober};
use super::port::{locate, Location, PortSelector};
use super::{StrategyTarget, WaitContext};
use crate::constants::wait as defaults;
use crate::error::{Result, TestbedError};

/// Builds a connection URL from the instance host and mapped port
pub type UrlBuilder = Arc<dyn Fn(&str, u16) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDriver {
    Postgres,
}

impl fmt::Display for SqlDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDriver::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Clone)]
pub struct SqlStrategy {
    port: PortSelector,
    driver: SqlDriver,
    url: UrlBuilder,
    query: String,
    poll_interval: Option<Duration>,
    startup_timeout: Option<Duration>,
}

impl fmt::Debug for SqlStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlStrategy")
            .field("port", &self.port)
            .field("driver", &self.driver)
            .field("query", &self.query)
            .field("poll_interval", &self.poll_interval)
            .field("startup_timeout", &self.startup_timeout)
            .finish()
    }
}

impl SqlStrategy {
    pub fn new<F>(port: &str, driver: SqlDriver, url: F) -> Self
    where
        F: Fn(&str, u16) -> String + Send + Sync + 'static,
    {
        Self {
            port: PortSelector::parse(port),
            driver,
            url: Arc::new(url),
            query: defaults::DEFAULT_SQL_QUERY.to_string(),
            poll_interval: None,
            startup_timeout: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn driver(&self) -> SqlDriver {
        self.driver
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub(crate) fn uses_first_exposed_port(&self) -> bool {
        matches!(self.port, PortSelector::FirstExposed)
    }

    pub fn validate(&self) -> Result<()> {
        self.port.validate()?;
        if self.query.trim().is_empty() {
            return Err(TestbedError::configuration("sql wait query cannot be empty"));
        }
        Ok(())
    }

    pub async fn wait_until_ready(&self, target: &dyn StrategyTarget, ctx: &WaitContext) -> Result<()> {
        let settings = PollSettings::resolve(
            self.to_string(),
            self.startup_timeout,
            self.poll_interval,
            ctx,
        );
        let mut prober = SqlProber { strategy: self };
        poll_until_ready(&settings, target, &ctx.cancellation, &mut prober).await
    }
}

impl fmt::Display for SqlStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sql {} on {}", self.driver, self.port)
    }
}

struct SqlProber<'a> {
    strategy: &'a SqlStrategy,
}

impl SqlProber<'_> {
    async fn probe_postgres(&self, url: &str) -> Result<Probe> {
        let mut conn = match sqlx::postgres::PgConnection::connect(url).await {
            Ok(conn) => conn,
            Err(sqlx::Error::Configuration(e)) => {
                return Err(TestbedError::configuration(format!(
                    "invalid sql wait connection url: {e}"
                )));
            }
            Err(e) => return Ok(Probe::NotReady(format!("connect failed: {e}"))),
        };

        let outcome = sqlx::query(&self.strategy.query).execute(&mut conn).await;
        if let Err(e) = conn.close().await {
            debug!(error = %e, "⚠️ WAIT: closing sql probe connection failed");
        }

        match outcome {
            Ok(_) => Ok(Probe::Ready),
            Err(e) => Ok(Probe::NotReady(format!("probe query failed: {e}"))),
        }
    }
}

#[async_trait]
impl Prober for SqlProber<'_> {
    async fn probe(&mut self, target: &dyn StrategyTarget) -> Result<Probe> {
        let (host, port) = match locate(target, &self.strategy.port).await? {
            Location::Mapped { host, port } => (host, port),
            Location::Pending(reason) => return Ok(Probe::NotReady(reason)),
        };
        let url = (self.strategy.url)(&host, port);

        match self.strategy.driver {
            SqlDriver::Postgres => self.probe_postgres(&url).await,
        }
    }
}
