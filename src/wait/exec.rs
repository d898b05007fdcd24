//! Exec readiness: a command run inside the instance exits as expected.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::poll::{poll_until_ready, PollSettings, Probe, Prober};
use super::{StrategyTarget, WaitContext};
use crate::error::{Result, TestbedError};

pub type ExitCodeMatcher = Arc<dyn Fn(i64) -> bool + Send + Sync>;
pub type OutputMatcher = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ExecStrategy {
    command: Vec<String>,
    exit_code_matcher: ExitCodeMatcher,
    response_matcher: Option<OutputMatcher>,
    poll_interval: Option<Duration>,
    startup_timeout: Option<Duration>,
}

impl fmt::Debug for ExecStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStrategy")
            .field("command", &self.command)
            .field("has_response_matcher", &self.response_matcher.is_some())
            .field("poll_interval", &self.poll_interval)
            .field("startup_timeout", &self.startup_timeout)
            .finish()
    }
}

impl ExecStrategy {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            exit_code_matcher: Arc::new(|code| code == 0),
            response_matcher: None,
            poll_interval: None,
            startup_timeout: None,
        }
    }

    pub fn with_exit_code_matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(i64) -> bool + Send + Sync + 'static,
    {
        self.exit_code_matcher = Arc::new(matcher);
        self
    }

    /// Additionally require the combined output to satisfy `matcher`
    pub fn with_response_matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.response_matcher = Some(Arc::new(matcher));
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

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(TestbedError::configuration(
                "exec wait strategy requires a command",
            ));
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
        let mut prober = ExecProber { strategy: self };
        poll_until_ready(&settings, target, &ctx.cancellation, &mut prober).await
    }
}

impl fmt::Display for ExecStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec {:?}", self.command.join(" "))
    }
}

struct ExecProber<'a> {
    strategy: &'a ExecStrategy,
}

#[async_trait]
impl Prober for ExecProber<'_> {
    async fn probe(&mut self, target: &dyn StrategyTarget) -> Result<Probe> {
        let output = target.exec(&self.strategy.command).await?;

        if !(self.strategy.exit_code_matcher)(output.exit_code) {
            return Ok(Probe::NotReady(format!(
                "exited with {}: {}",
                output.exit_code,
                output.output_lossy().trim()
            )));
        }
        if let Some(matcher) = &self.strategy.response_matcher {
            if !matcher(&output.output) {
                return Ok(Probe::NotReady("output did not match".to_string()));
            }
        }
        Ok(Probe::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecOutput, LogStream, PortSpec};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Debug)]
    struct ScriptedExec {
        results: Mutex<VecDeque<Result<ExecOutput>>>,
    }

    impl ScriptedExec {
        fn new(results: Vec<Result<ExecOutput>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl StrategyTarget for ScriptedExec {
        fn exposed_ports(&self) -> Vec<PortSpec> {
            Vec::new()
        }
        async fn host(&self) -> Result<String> {
            Ok("localhost".to_string())
        }
        async fn mapped_port(&self, port: &PortSpec) -> Result<u16> {
            Ok(port.port)
        }
        async fn logs(&self) -> Result<LogStream> {
            Ok(LogStream::default())
        }
        async fn exec(&self, _command: &[String]) -> Result<ExecOutput> {
            self.results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ExecOutput::new(0, "ok")))
        }
    }

    fn fast() -> ExecStrategy {
        ExecStrategy::new(["pg_isready"])
            .with_poll_interval(Duration::from_millis(10))
            .with_startup_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_retries_until_exit_zero() {
        let target = ScriptedExec::new(vec![
            Ok(ExecOutput::new(2, "no response")),
            Ok(ExecOutput::new(1, "rejecting")),
        ]);
        fast().wait_until_ready(&target, &WaitContext::default()).await.unwrap();
        assert!(target.results.lock().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_error_is_immediate() {
        let target = ScriptedExec::new(vec![Err(TestbedError::runtime("exec", "gone"))]);
        let err = fast()
            .wait_until_ready(&target, &WaitContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Runtime);
    }

    #[tokio::test]
    async fn test_response_matcher() {
        let target = ScriptedExec::new(vec![
            Ok(ExecOutput::new(0, "starting")),
            Ok(ExecOutput::new(0, "accepting connections")),
        ]);
        fast()
            .with_response_matcher(|out| String::from_utf8_lossy(out).contains("accepting"))
            .wait_until_ready(&target, &WaitContext::default())
            .await
            .unwrap();
    }

    #[test]
    fn test_empty_command_is_invalid() {
        assert!(ExecStrategy::new(Vec::<String>::new()).validate().is_err());
        assert!(ExecStrategy::new([" "]).validate().is_err());
        assert!(ExecStrategy::new(["true"]).validate().is_ok());
    }
}
