//! # Runtime Client Boundary
//!
//! The container engine is reached only through [`RuntimeClient`]. This crate
//! never talks to an engine directly; connection pooling, authentication and
//! image handling are the implementor's concern. Implementations must be safe
//! for concurrent use since every launch task in a batch shares one client.

pub mod port;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::Result;

pub use port::{PortSpec, Protocol};

/// Opaque reference to an instance known to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub id: String,
}

impl InstanceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // engine ids are long; 12 characters is what engines print
        let short = self.id.get(..12).unwrap_or(&self.id);
        write!(f, "{short}")
    }
}

/// What the runtime needs to create an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSpec {
    pub image: String,
    pub name: Option<String>,
    pub exposed_ports: Vec<PortSpec>,
    pub env: HashMap<String, String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Result of running a command inside an instance
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn new(exit_code: i64, output: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// How the bytes of a log stream are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFraming {
    /// Plain bytes, as produced by a TTY-attached instance
    #[default]
    Raw,
    /// 8-byte headers (`[stream, 0, 0, 0, len_be_u32]`) precede every frame
    Multiplexed,
}

/// Everything the instance has written since it was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStream {
    pub bytes: Vec<u8>,
    pub framing: LogFraming,
}

impl LogStream {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            framing: LogFraming::Raw,
        }
    }

    pub fn multiplexed(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            framing: LogFraming::Multiplexed,
        }
    }
}

/// Low-level container runtime primitives consumed by the launcher and the
/// readiness strategies.
///
/// Errors should be reported as [`crate::TestbedError::Runtime`]; the launcher
/// re-tags create and start failures with their launch stage.
#[async_trait]
pub trait RuntimeClient: Send + Sync + fmt::Debug {
    async fn create(&self, spec: &CreateSpec) -> Result<InstanceRef>;

    async fn start(&self, instance: &InstanceRef) -> Result<()>;

    /// Look up a live instance by name, for reuse
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRef>>;

    async fn inspect_mapped_port(&self, instance: &InstanceRef, port: &PortSpec) -> Result<u16>;

    async fn inspect_host(&self, instance: &InstanceRef) -> Result<String>;

    async fn fetch_logs(&self, instance: &InstanceRef) -> Result<LogStream>;

    async fn copy_file(
        &self,
        instance: &InstanceRef,
        contents: Vec<u8>,
        path: &str,
        mode: u32,
    ) -> Result<()>;

    async fn execute(&self, instance: &InstanceRef, command: &[String]) -> Result<ExecOutput>;

    async fn terminate(&self, instance: &InstanceRef) -> Result<()>;
}
