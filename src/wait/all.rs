//! All-of readiness: every child strategy succeeds, evaluated in order.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{StrategyTarget, WaitContext, WaitStrategy};
use crate::error::{Result, TestbedError};

#[derive(Debug, Clone, Default)]
pub struct AllStrategy {
    strategies: Vec<WaitStrategy>,
    deadline: Option<Duration>,
}

impl AllStrategy {
    pub fn new(strategies: Vec<WaitStrategy>) -> Self {
        Self {
            strategies,
            deadline: None,
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<WaitStrategy>) -> Self {
        self.strategies.push(strategy.into());
        self
    }

    /// Bound the whole sequence; children keep their own timeouts within it
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn strategies(&self) -> &[WaitStrategy] {
        &self.strategies
    }

    pub fn validate(&self) -> Result<()> {
        if self.deadline == Some(Duration::ZERO) {
            return Err(TestbedError::configuration(
                "all-of wait deadline must be greater than zero",
            ));
        }
        self.strategies.iter().try_for_each(WaitStrategy::validate)
    }

    /// Run children in order and stop at the first failure.
    ///
    /// An empty list is ready immediately.
    pub async fn wait_until_ready(&self, target: &dyn StrategyTarget, ctx: &WaitContext) -> Result<()> {
        let started = Instant::now();
        let sequence = self.run_sequence(target, ctx);

        let Some(deadline) = self.deadline else {
            return sequence.await;
        };
        match tokio::time::timeout(deadline, sequence).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TestbedError::ReadinessTimeout {
                strategy: self.to_string(),
                elapsed: started.elapsed(),
                last_observation: format!("overall deadline of {deadline:?} exceeded"),
            }),
        }
    }

    async fn run_sequence(&self, target: &dyn StrategyTarget, ctx: &WaitContext) -> Result<()> {
        for (position, strategy) in self.strategies.iter().enumerate() {
            strategy.wait_until_ready(target, ctx).await?;
            debug!(
                strategy = %strategy,
                position = position,
                total = self.strategies.len(),
                "✅ WAIT: all-of member ready"
            );
        }
        Ok(())
    }
}

impl fmt::Display for AllStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all-of [")?;
        for (position, strategy) in self.strategies.iter().enumerate() {
            if position > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{strategy}")?;
        }
        write!(f, "]")
    }
}
