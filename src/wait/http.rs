//! HTTP readiness: a request to a path on a mapped port answers as expected.
//!
//! Connection refusals, resets and per-request timeouts are "not ready yet".
//! A malformed URL, an unresolvable host or a client that cannot be built
//! fail the wait at once.

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::poll::{poll_until_ready, resolve, PollSettings, Probe, Prober};
use super::port::{locate, Location, PortSelector};
use super::{StrategyTarget, WaitContext};
use crate::constants::wait as defaults;
use crate::error::{Result, TestbedError};

pub type StatusMatcher = Arc<dyn Fn(u16) -> bool + Send + Sync>;
pub type BodyMatcher = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct HttpStrategy {
    path: String,
    port: PortSelector,
    method: Method,
    use_tls: bool,
    allow_insecure: bool,
    headers: Vec<(String, String)>,
    status_matcher: StatusMatcher,
    body_matcher: Option<BodyMatcher>,
    request_timeout: Duration,
    poll_interval: Option<Duration>,
    startup_timeout: Option<Duration>,
}

impl fmt::Debug for HttpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStrategy")
            .field("path", &self.path)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("use_tls", &self.use_tls)
            .field("headers", &self.headers)
            .field("has_body_matcher", &self.body_matcher.is_some())
            .field("poll_interval", &self.poll_interval)
            .field("startup_timeout", &self.startup_timeout)
            .finish()
    }
}

impl HttpStrategy {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            port: PortSelector::FirstExposed,
            method: Method::GET,
            use_tls: false,
            allow_insecure: false,
            headers: Vec::new(),
            status_matcher: Arc::new(|status| status == defaults::DEFAULT_HTTP_STATUS),
            body_matcher: None,
            request_timeout: defaults::HTTP_REQUEST_TIMEOUT,
            poll_interval: None,
            startup_timeout: None,
        }
    }

    pub fn with_port(mut self, spec: &str) -> Self {
        self.port = PortSelector::parse(spec);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Use https; `allow_insecure` skips certificate verification
    pub fn with_tls(mut self, allow_insecure: bool) -> Self {
        self.use_tls = true;
        self.allow_insecure = allow_insecure;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_status_code_matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(u16) -> bool + Send + Sync + 'static,
    {
        self.status_matcher = Arc::new(matcher);
        self
    }

    pub fn with_response_matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.body_matcher = Some(Arc::new(matcher));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
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

    pub(crate) fn uses_first_exposed_port(&self) -> bool {
        matches!(self.port, PortSelector::FirstExposed)
    }

    pub fn validate(&self) -> Result<()> {
        self.port.validate()?;
        if !self.path.is_empty() && !self.path.starts_with('/') {
            return Err(TestbedError::configuration(format!(
                "http wait path '{}' must start with '/'",
                self.path
            )));
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

        let client = Client::builder()
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(self.allow_insecure)
            .build()
            .map_err(|e| TestbedError::transport("build http client", e))?;

        let mut prober = HttpProber {
            strategy: self,
            client,
        };
        poll_until_ready(&settings, target, &ctx.cancellation, &mut prober).await
    }

    fn url(&self, host: &str, port: u16) -> Result<Url> {
        let scheme = if self.use_tls { "https" } else { "http" };
        let raw = format!("{scheme}://{host}:{port}{}", self.path);
        Url::parse(&raw)
            .map_err(|e| TestbedError::configuration(format!("invalid http wait url '{raw}': {e}")))
    }
}

impl fmt::Display for HttpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http {} {} on {}", self.method, self.path, self.port)
    }
}

struct HttpProber<'a> {
    strategy: &'a HttpStrategy,
    client: Client,
}

#[async_trait]
impl Prober for HttpProber<'_> {
    async fn probe(&mut self, target: &dyn StrategyTarget) -> Result<Probe> {
        let (host, port) = match locate(target, &self.strategy.port).await? {
            Location::Mapped { host, port } => (host, port),
            Location::Pending(reason) => return Ok(Probe::NotReady(reason)),
        };
        resolve(&host, port).await?;
        let url = self.strategy.url(&host, port)?;

        let mut request = self.client.request(self.strategy.method.clone(), url.clone());
        for (name, value) in &self.strategy.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(TestbedError::transport(format!("http request to {url}"), e));
            }
            Err(e) => return Ok(Probe::NotReady(format!("{url}: {e}"))),
        };

        let status = response.status().as_u16();
        if !(self.strategy.status_matcher)(status) {
            return Ok(Probe::NotReady(format!("{url} answered {status}")));
        }

        if let Some(matcher) = &self.strategy.body_matcher {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => return Ok(Probe::NotReady(format!("{url} body unreadable: {e}"))),
            };
            if !matcher(&body) {
                return Ok(Probe::NotReady(format!("{url} body did not match")));
            }
        }

        Ok(Probe::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let strategy = HttpStrategy::new("/health");
        assert!(strategy.validate().is_ok());
        assert!((strategy.status_matcher)(200));
        assert!(!(strategy.status_matcher)(503));
        assert_eq!(strategy.to_string(), "http GET /health on first exposed port");
    }

    #[test]
    fn test_url_building() {
        let plain = HttpStrategy::new("/health").with_port("8080/tcp");
        assert_eq!(
            plain.url("localhost", 32768).unwrap().as_str(),
            "http://localhost:32768/health"
        );

        let tls = HttpStrategy::new("/").with_tls(true);
        assert_eq!(tls.url("127.0.0.1", 443).unwrap().scheme(), "https");
    }

    #[test]
    fn test_validation_rejects_relative_path() {
        assert!(HttpStrategy::new("health").validate().is_err());
        assert!(HttpStrategy::new("/").with_port("x").validate().is_err());
    }
}
