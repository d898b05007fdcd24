//! Error types for launching and waiting on test instances.
//!

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigurationError;
use crate::lifecycle::LifecyclePhase;

pub type Result<T> = std::result::Result<T, TestbedError>;

/// Every failure a launch, a readiness wait, or a handle operation can produce.
#[derive(Debug, Clone, Error)]
pub enum TestbedError {
    /// A bad option or request field. Raised before any concurrent work starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A caller-supplied request customizer rejected the request.
    #[error("Customization error: {0}")]
    Customization(String),

    /// The runtime client refused to create the instance (bad image, bad spec).
    #[error("Creation error for image '{image}': {reason}")]
    Creation { image: String, reason: String },

    /// A lifecycle callback failed and aborted the transition.
    #[error("Hook error during {phase}: {reason}")]
    Hook {
        phase: LifecyclePhase,
        reason: String,
    },

    #[error("Start error for instance {instance_id}: {reason}")]
    Start { instance_id: String, reason: String },

    #[error("Failed to copy '{destination}' into instance {instance_id}: {reason}")]
    FileCopy {
        instance_id: String,
        destination: String,
        reason: String,
    },

    /// The readiness strategy never succeeded within its budget.
    #[error("Readiness timeout for {strategy} after {elapsed:?}: {last_observation}")]
    ReadinessTimeout {
        strategy: String,
        elapsed: Duration,
        last_observation: String,
    },

    /// A network or process failure that is not "not ready yet". Never retried.
    #[error("Transport error in {operation}: {reason}")]
    Transport { operation: String, reason: String },

    #[error("Stopping log consumer: headers out of sync at byte {offset}")]
    LogStreamOutOfSync { offset: usize },

    /// The caller (or the batch deadline) abandoned the operation.
    #[error("Cancelled during {operation}")]
    Cancelled { operation: String },

    #[error("Runtime error in {operation}: {reason}")]
    Runtime { operation: String, reason: String },

    #[error("Instance {instance_id} is already terminated")]
    AlreadyTerminated { instance_id: String },
}

/// Coarse classification of a [`TestbedError`], used to count failures by cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Customization,
    Creation,
    Hook,
    Start,
    FileCopy,
    ReadinessTimeout,
    Transport,
    LogStreamOutOfSync,
    Cancelled,
    Runtime,
    AlreadyTerminated,
}

impl TestbedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TestbedError::Configuration(_) => ErrorKind::Configuration,
            TestbedError::Customization(_) => ErrorKind::Customization,
            TestbedError::Creation { .. } => ErrorKind::Creation,
            TestbedError::Hook { .. } => ErrorKind::Hook,
            TestbedError::Start { .. } => ErrorKind::Start,
            TestbedError::FileCopy { .. } => ErrorKind::FileCopy,
            TestbedError::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            TestbedError::Transport { .. } => ErrorKind::Transport,
            TestbedError::LogStreamOutOfSync { .. } => ErrorKind::LogStreamOutOfSync,
            TestbedError::Cancelled { .. } => ErrorKind::Cancelled,
            TestbedError::Runtime { .. } => ErrorKind::Runtime,
            TestbedError::AlreadyTerminated { .. } => ErrorKind::AlreadyTerminated,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        TestbedError::Configuration(msg.into())
    }

    pub fn transport(operation: impl Into<String>, reason: impl ToString) -> Self {
        TestbedError::Transport {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn runtime(operation: impl Into<String>, reason: impl ToString) -> Self {
        TestbedError::Runtime {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        TestbedError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn hook(phase: LifecyclePhase, reason: impl ToString) -> Self {
        TestbedError::Hook {
            phase,
            reason: reason.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TestbedError::Cancelled { .. })
    }
}

impl From<ConfigurationError> for TestbedError {
    fn from(error: ConfigurationError) -> Self {
        TestbedError::Configuration(error.to_string())
    }
}

impl From<regex::Error> for TestbedError {
    fn from(error: regex::Error) -> Self {
        TestbedError::Configuration(format!("invalid log pattern: {error}"))
    }
}
