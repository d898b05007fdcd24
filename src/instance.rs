//! # Instance Handles
//!
//! An [`Instance`] is what the launcher hands back for every request that
//! reached a ready state. Clones of a handle share its termination state;
//! handles produced by separate reuse launches of the same name share a lease
//! instead, and only the last one to terminate removes the runtime instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, TestbedError};
use crate::launcher::reuse::{Lease, Release};
use crate::lifecycle::{HookContext, HookExecutor, LifecycleHooks, LifecyclePhase};
use crate::runtime::{ExecOutput, InstanceRef, LogStream, PortSpec, RuntimeClient};
use crate::wait::StrategyTarget;

/// What a call to [`Instance::terminate`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateOutcome {
    /// The runtime instance was removed
    Terminated,
    /// This handle let go; other handles of the same reused instance remain
    Released,
    /// The instance was created outside this launcher and was left running
    Detached,
    /// This handle was already terminated
    AlreadyTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Live,
    /// Released from its lease but the runtime removal has not succeeded yet
    RemovalPending,
    Done,
}

struct InstanceInner {
    runtime: Arc<dyn RuntimeClient>,
    reference: InstanceRef,
    name: Option<String>,
    image: String,
    exposed_ports: Vec<PortSpec>,
    hooks: LifecycleHooks,
    reused: bool,
    lease: Option<Arc<Lease>>,
    terminated: AtomicBool,
    state: AsyncMutex<HandleState>,
}

#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.reference.id)
            .field("name", &self.inner.name)
            .field("image", &self.inner.image)
            .field("reused", &self.inner.reused)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Identity of an instance as seen by the launcher
pub(crate) struct InstanceParts {
    pub reference: InstanceRef,
    pub name: Option<String>,
    pub image: String,
    pub exposed_ports: Vec<PortSpec>,
    pub hooks: LifecycleHooks,
}

impl Instance {
    pub(crate) fn new(
        runtime: Arc<dyn RuntimeClient>,
        parts: InstanceParts,
        lease: Option<Arc<Lease>>,
        reused: bool,
    ) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                runtime,
                reference: parts.reference,
                name: parts.name,
                image: parts.image,
                exposed_ports: parts.exposed_ports,
                hooks: parts.hooks,
                reused,
                lease,
                terminated: AtomicBool::new(false),
                state: AsyncMutex::new(HandleState::Live),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.reference.id
    }

    pub fn reference(&self) -> &InstanceRef {
        &self.inner.reference
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn image(&self) -> &str {
        &self.inner.image
    }

    pub fn exposed_ports(&self) -> &[PortSpec] {
        &self.inner.exposed_ports
    }

    /// True when this handle attached to an instance another launch created
    pub fn is_reused(&self) -> bool {
        self.inner.reused
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub async fn host(&self) -> Result<String> {
        self.ensure_live("inspect host")?;
        self.inner.runtime.inspect_host(&self.inner.reference).await
    }

    /// Host port mapped to `port` (e.g. `"5432/tcp"` or `"8080"`)
    pub async fn mapped_port(&self, port: &str) -> Result<u16> {
        let port: PortSpec = port.parse()?;
        self.ensure_live("inspect mapped port")?;
        self.inner
            .runtime
            .inspect_mapped_port(&self.inner.reference, &port)
            .await
    }

    /// `host:mapped_port` for `port`
    pub async fn endpoint(&self, port: &str) -> Result<String> {
        let mapped = self.mapped_port(port).await?;
        let host = self.host().await?;
        Ok(format!("{host}:{mapped}"))
    }

    pub async fn logs(&self) -> Result<LogStream> {
        self.ensure_live("fetch logs")?;
        self.inner.runtime.fetch_logs(&self.inner.reference).await
    }

    pub async fn exec<S: AsRef<str>>(&self, command: &[S]) -> Result<ExecOutput> {
        let command: Vec<String> = command.iter().map(|part| part.as_ref().to_string()).collect();
        self.ensure_live("exec")?;
        self.inner.runtime.execute(&self.inner.reference, &command).await
    }

    pub async fn copy_file(&self, contents: impl Into<Vec<u8>>, path: &str, mode: u32) -> Result<()> {
        self.ensure_live("copy file")?;
        self.inner
            .runtime
            .copy_file(&self.inner.reference, contents.into(), path, mode)
            .await
    }

    /// Release this handle, removing the runtime instance when nothing else
    /// holds it.
    ///
    /// Pre- and post-terminate hooks run only when the instance is actually
    /// removed, and they are the hooks of the request that created it, even
    /// when the last handle released belongs to a later reuse launch. If a pre-terminate hook or the runtime removal fails the error
    /// is returned and a later call retries the removal.
    pub async fn terminate(&self) -> Result<TerminateOutcome> {
        let mut state = self.inner.state.lock().await;

        match *state {
            HandleState::Done => return Ok(TerminateOutcome::AlreadyTerminated),
            HandleState::RemovalPending => {}
            HandleState::Live => {
                if let Some(lease) = &self.inner.lease {
                    match lease.release() {
                        Release::Remaining(remaining) => {
                            info!(
                                instance_id = %self.inner.reference,
                                remaining = remaining,
                                "♻️ INSTANCE: released shared handle"
                            );
                            self.finish(&mut state);
                            return Ok(TerminateOutcome::Released);
                        }
                        Release::Last { owned: false } => {
                            info!(
                                instance_id = %self.inner.reference,
                                "♻️ INSTANCE: detached from externally created instance"
                            );
                            self.finish(&mut state);
                            return Ok(TerminateOutcome::Detached);
                        }
                        Release::Last { owned: true } => {}
                    }
                }
                *state = HandleState::RemovalPending;
            }
        }

        self.remove().await?;
        self.finish(&mut state);
        info!(instance_id = %self.inner.reference, image = %self.inner.image, "🗑️ INSTANCE: terminated");
        Ok(TerminateOutcome::Terminated)
    }

    /// Drop this handle's claim without touching the runtime instance.
    ///
    /// Used for launches that failed after creation when cleanup is disabled,
    /// so a later reuse launch does not attach to the failed instance.
    pub(crate) async fn abandon(&self) {
        let mut state = self.inner.state.lock().await;
        if *state == HandleState::Live {
            if let Some(lease) = &self.inner.lease {
                lease.release();
            }
        }
        self.finish(&mut state);
    }

    fn finish(&self, state: &mut HandleState) {
        *state = HandleState::Done;
        self.inner.terminated.store(true, Ordering::Release);
    }

    async fn remove(&self) -> Result<()> {
        let executor = HookExecutor::new(CancellationToken::new());
        let hooks = self
            .inner
            .lease
            .as_ref()
            .map_or(&self.inner.hooks, |lease| lease.hooks());

        executor
            .run_phase(hooks, LifecyclePhase::PreTerminate, &self.hook_context(LifecyclePhase::PreTerminate))
            .await?;

        if let Err(error) = self.inner.runtime.terminate(&self.inner.reference).await {
            warn!(
                instance_id = %self.inner.reference,
                error = %error,
                "❌ INSTANCE: runtime terminate failed"
            );
            return Err(error);
        }

        executor
            .run_phase(hooks, LifecyclePhase::PostTerminate, &self.hook_context(LifecyclePhase::PostTerminate))
            .await
    }

    pub(crate) fn hook_context(&self, phase: LifecyclePhase) -> HookContext {
        HookContext {
            phase,
            image: self.inner.image.clone(),
            name: self.inner.name.clone(),
            instance: Some(self.clone()),
        }
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.is_terminated() {
            warn!(
                instance_id = %self.inner.reference,
                operation = operation,
                "⚠️ INSTANCE: operation on terminated handle"
            );
            return Err(TestbedError::AlreadyTerminated {
                instance_id: self.inner.reference.id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StrategyTarget for Instance {
    fn exposed_ports(&self) -> Vec<PortSpec> {
        self.inner.exposed_ports.clone()
    }

    async fn host(&self) -> Result<String> {
        Instance::host(self).await
    }

    async fn mapped_port(&self, port: &PortSpec) -> Result<u16> {
        self.ensure_live("inspect mapped port")?;
        self.inner
            .runtime
            .inspect_mapped_port(&self.inner.reference, port)
            .await
    }

    async fn logs(&self) -> Result<LogStream> {
        Instance::logs(self).await
    }

    async fn exec(&self, command: &[String]) -> Result<ExecOutput> {
        Instance::exec(self, command).await
    }
}
