//! # Lifecycle Hooks
//!
//! Ordered callbacks bound to the transition points of an instance's life.
//! Hooks for one phase run in registration order; the first failure aborts the
//! phase, and the caller is expected to abort every later phase as well.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TestbedError};
use crate::instance::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    PreCreate,
    PostCreate,
    PreStart,
    PostStart,
    /// After the readiness strategy succeeded
    PostReady,
    PreTerminate,
    PostTerminate,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::PreCreate => "pre_create",
            LifecyclePhase::PostCreate => "post_create",
            LifecyclePhase::PreStart => "pre_start",
            LifecyclePhase::PostStart => "post_start",
            LifecyclePhase::PostReady => "post_ready",
            LifecyclePhase::PreTerminate => "pre_terminate",
            LifecyclePhase::PostTerminate => "post_terminate",
        };
        f.write_str(name)
    }
}

/// What a hook gets to see. `instance` is `None` only during `PreCreate`.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub phase: LifecyclePhase,
    pub image: String,
    pub name: Option<String>,
    pub instance: Option<Instance>,
}

impl HookContext {
    /// The instance this hook runs against, or a hook error if there is none yet
    pub fn require_instance(&self) -> Result<&Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| TestbedError::hook(self.phase, "no instance exists in this phase"))
    }
}

pub type HookFuture = BoxFuture<'static, Result<()>>;
pub type Hook = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

/// Wrap an async closure as a [`Hook`]
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Hooks registered per phase, in registration order
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    phases: BTreeMap<LifecyclePhase, Vec<Hook>>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<String, usize> = self
            .phases
            .iter()
            .map(|(phase, hooks)| (phase.to_string(), hooks.len()))
            .collect();
        f.debug_struct("LifecycleHooks")
            .field("phases", &counts)
            .finish()
    }
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, phase: LifecyclePhase, hook: Hook) -> Self {
        self.add(phase, hook);
        self
    }

    pub fn add(&mut self, phase: LifecyclePhase, hook: Hook) {
        self.phases.entry(phase).or_default().push(hook);
    }

    /// Append every hook of `other` after the hooks already registered here
    pub fn extend(&mut self, other: LifecycleHooks) {
        for (phase, hooks) in other.phases {
            self.phases.entry(phase).or_default().extend(hooks);
        }
    }

    pub fn hooks_for(&self, phase: LifecyclePhase) -> &[Hook] {
        self.phases.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.phases.values().all(Vec::is_empty)
    }
}

/// Runs one phase of hooks against a context
#[derive(Debug, Clone)]
pub struct HookExecutor {
    cancellation: CancellationToken,
}

impl HookExecutor {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    /// Run every hook of `phase` in order, stopping at the first failure.
    ///
    /// Hook failures come back as [`TestbedError::Hook`]; cancellation while a
    /// hook is running comes back as [`TestbedError::Cancelled`].
    pub async fn run_phase(
        &self,
        hooks: &LifecycleHooks,
        phase: LifecyclePhase,
        ctx: &HookContext,
    ) -> Result<()> {
        let registered = hooks.hooks_for(phase);
        if registered.is_empty() {
            return Ok(());
        }

        debug!(phase = %phase, count = registered.len(), image = %ctx.image, "🪝 HOOK: running phase");

        for (position, callback) in registered.iter().enumerate() {
            let mut phase_ctx = ctx.clone();
            phase_ctx.phase = phase;

            let outcome = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    return Err(TestbedError::cancelled(format!("{phase} hook")));
                }
                outcome = callback(phase_ctx) => outcome,
            };

            if let Err(error) = outcome {
                warn!(
                    phase = %phase,
                    position = position,
                    image = %ctx.image,
                    error = %error,
                    "❌ HOOK: callback failed, aborting transition"
                );
                return Err(match error {
                    TestbedError::Cancelled { .. } | TestbedError::Hook { .. } => error,
                    other => TestbedError::hook(phase, other),
                });
            }
        }

        Ok(())
    }
}
