//! # Parallel Launcher
//!
//! Launches instance requests, one task per request, and joins them all.
//!
//! ## Launch pipeline
//!
//! Each request goes through the same steps, and the first failure ends that
//! request without affecting its siblings:
//!
//! 1. customizers, then request validation
//! 2. reuse lookup (attach to a live instance of the same name and stop here)
//! 3. `pre_create` hooks, file reads, runtime create, `post_create` hooks
//! 4. file copies
//! 5. `pre_start` hooks, runtime start, `post_start` hooks
//! 6. readiness wait, `post_ready` hooks, after-ready commands
//!
//! Instances that were created but failed a later step are terminated
//! best-effort when `cleanup_failed_instances` is enabled. Successful handles
//! are always left to the caller.
//!
//! ```rust
//! use std::sync::Arc;
//! use testbed_core::test_utils::FakeRuntime;
//! use testbed_core::{InstanceRequest, LaunchOptions, Launcher};
//!
//! # tokio_test::block_on(async {
//! let runtime = Arc::new(FakeRuntime::new());
//! runtime.fail_create("missing:latest");
//! let launcher = Launcher::new(runtime);
//!
//! let requests = vec![
//!     InstanceRequest::builder("redis:7").build().unwrap(),
//!     InstanceRequest::builder("missing:latest").build().unwrap(),
//! ];
//! let outcome = launcher.launch_all(requests, &LaunchOptions::default()).await;
//!
//! assert_eq!(outcome.instances.len(), 1);
//! assert_eq!(outcome.error.unwrap().failures()[0].index, 1);
//! # });
//! ```

pub mod aggregate;
pub mod options;
pub(crate) mod reuse;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigManager, TestbedConfig, WaitConfig};
use crate::constants;
use crate::error::{Result, TestbedError};
use crate::instance::{Instance, InstanceParts};
use crate::lifecycle::{HookContext, HookExecutor, LifecycleHooks, LifecyclePhase};
use crate::logging::{log_error, log_launch_operation, log_wait_operation};
use crate::request::InstanceRequest;
use crate::runtime::{InstanceRef, RuntimeClient};
use crate::wait::WaitContext;

pub use aggregate::{BatchLaunchError, BatchOutcome, LaunchFailure};
pub use options::{LaunchOptions, LaunchOptionsBuilder};

use options::ResolvedOptions;
use reuse::ReuseRegistry;

/// Launches instance requests against one runtime client.
///
/// Cloning is cheap; clones share the runtime client and the reuse registry.
#[derive(Debug, Clone)]
pub struct Launcher {
    runtime: Arc<dyn RuntimeClient>,
    config: Arc<TestbedConfig>,
    reuse: Arc<ReuseRegistry>,
    session_id: Uuid,
}

impl Launcher {
    /// Launcher using the global configuration
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self::with_config(runtime, ConfigManager::global())
    }

    pub fn with_config(runtime: Arc<dyn RuntimeClient>, config: Arc<ConfigManager>) -> Self {
        Self {
            runtime,
            config: Arc::new(config.config().clone()),
            reuse: ReuseRegistry::new(),
            session_id: Uuid::new_v4(),
        }
    }

    /// Session label value stamped on every instance this launcher creates
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.config
    }

    /// Launch a single request with default options
    pub async fn launch(&self, request: InstanceRequest) -> Result<Instance> {
        self.launch_with(request, &LaunchOptions::default()).await
    }

    pub async fn launch_with(&self, request: InstanceRequest, options: &LaunchOptions) -> Result<Instance> {
        let resolved = options.resolve(&self.config.launcher);
        let cancellation = resolved.cancellation.child_token();
        let timer = spawn_deadline(&resolved, &cancellation);

        let outcome = self.task(&resolved, cancellation.clone()).run(request).await;

        cancellation.cancel();
        if let Some(timer) = timer {
            timer.abort();
        }
        outcome
    }

    /// Launch every request concurrently and wait for all of them.
    ///
    /// The returned handles are in submission order. Every failed request
    /// contributes exactly one entry to the error, so
    /// `instances.len() + error.len() == requests.len()`.
    pub async fn launch_all(&self, requests: Vec<InstanceRequest>, options: &LaunchOptions) -> BatchOutcome {
        let submitted = requests.len();
        if submitted == 0 {
            return BatchOutcome {
                instances: Vec::new(),
                error: None,
            };
        }

        let resolved = options.resolve(&self.config.launcher);
        let cancellation = resolved.cancellation.child_token();
        let timer = spawn_deadline(&resolved, &cancellation);
        let semaphore = resolved
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.clamp(1, Semaphore::MAX_PERMITS))));
        let started = Instant::now();

        info!(
            requests = submitted,
            max_concurrency = ?resolved.max_concurrency,
            timeout_ms = resolved.timeout.map(|t| t.as_millis() as u64),
            session_id = %self.session_id,
            "🚀 LAUNCH: starting batch"
        );

        let mut handles = Vec::with_capacity(submitted);
        for (index, request) in requests.into_iter().enumerate() {
            let name = request.display_name();
            let task = self.task(&resolved, cancellation.clone());
            let semaphore = semaphore.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => {
                        let permit = tokio::select! {
                            biased;
                            _ = task.cancellation.cancelled() => {
                                return Err(TestbedError::cancelled("waiting for a launch slot"));
                            }
                            permit = semaphore.acquire_owned() => permit,
                        };
                        Some(permit.map_err(|e| TestbedError::runtime("acquire launch slot", e))?)
                    }
                    None => None,
                };
                task.run(request).await
            });
            handles.push((index, name, handle));
        }

        let mut instances = Vec::with_capacity(submitted);
        let mut failures = Vec::new();
        for (index, name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = TestbedError::runtime("launch task", format!("task panicked: {e}"));
                    log_error("launcher", "launch_all", &error.to_string(), Some(&name));
                    Err(error)
                }
            };
            match outcome {
                Ok(instance) => instances.push(instance),
                Err(error) => {
                    debug!(index = index, name = %name, error = %error, "❌ LAUNCH: request failed");
                    failures.push(LaunchFailure { index, name, error });
                }
            }
        }

        cancellation.cancel();
        if let Some(timer) = timer {
            timer.abort();
        }

        info!(
            requests = submitted,
            launched = instances.len(),
            failed = failures.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "🏁 LAUNCH: batch complete"
        );

        BatchOutcome {
            instances,
            error: BatchLaunchError::from_failures(failures, submitted),
        }
    }

    fn task(&self, options: &ResolvedOptions, cancellation: CancellationToken) -> LaunchTask {
        LaunchTask {
            runtime: self.runtime.clone(),
            reuse: self.reuse.clone(),
            wait_defaults: self.config.wait.clone(),
            session_id: self.session_id,
            cleanup_failed_instances: options.cleanup_failed_instances,
            cancellation,
        }
    }
}

/// Cancel `cancellation` once the configured timeout elapses
fn spawn_deadline(
    options: &ResolvedOptions,
    cancellation: &CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let timeout = options.timeout?;
    let token = cancellation.clone();
    Some(tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "⏰ LAUNCH: deadline reached, cancelling in-flight launches");
                token.cancel();
            }
        }
    }))
}

/// Everything one request's launch needs, owned so it can move into a task
struct LaunchTask {
    runtime: Arc<dyn RuntimeClient>,
    reuse: Arc<ReuseRegistry>,
    wait_defaults: WaitConfig,
    session_id: Uuid,
    cleanup_failed_instances: bool,
    cancellation: CancellationToken,
}

impl LaunchTask {
    async fn run(&self, mut request: InstanceRequest) -> Result<Instance> {
        request.apply_customizers()?;

        if !request.reuse {
            return self.create_and_prepare(&request, false).await;
        }

        let name = request.name.clone().unwrap_or_default();
        let _guard = self
            .cancellable(format!("waiting for reuse lock on '{name}'"), async {
                Ok(self.reuse.lock_name(&name).await)
            })
            .await?;

        if let Some(lease) = self.reuse.attach(&name) {
            info!(name = %name, instance_id = %lease.reference(), holders = lease.holders(), "♻️ REUSE: attached to live instance");
            return Ok(self.instance(&request, lease.reference().clone(), Some(lease), true));
        }

        let existing = self
            .cancellable(format!("looking up '{name}'"), self.runtime.find_by_name(&name))
            .await?;
        if let Some(reference) = existing {
            info!(name = %name, instance_id = %reference, "♻️ REUSE: attached to externally created instance");
            let lease = self.reuse.register(&name, reference.clone(), false, LifecycleHooks::default());
            let instance = self.instance(&request, reference, Some(lease), true);
            if let Err(error) = self.wait_until_ready(&request, &instance).await {
                instance.abandon().await;
                return Err(error);
            }
            return Ok(instance);
        }

        self.create_and_prepare(&request, true).await
    }

    async fn create_and_prepare(&self, request: &InstanceRequest, register_lease: bool) -> Result<Instance> {
        let executor = HookExecutor::new(self.cancellation.clone());
        let pre_create = HookContext {
            phase: LifecyclePhase::PreCreate,
            image: request.image.clone(),
            name: request.name.clone(),
            instance: None,
        };
        executor
            .run_phase(&request.hooks, LifecyclePhase::PreCreate, &pre_create)
            .await?;

        let mut contents = Vec::with_capacity(request.files.len());
        for file in &request.files {
            contents.push(file.read().await?);
        }

        let mut spec = request.create_spec();
        spec.labels.insert(
            constants::request::LABEL_SESSION.to_string(),
            self.session_id.to_string(),
        );
        let reference = self
            .cancellable(format!("creating {}", request.display_name()), self.runtime.create(&spec))
            .await
            .map_err(|e| match e {
                TestbedError::Cancelled { .. } => e,
                other => TestbedError::Creation {
                    image: request.image.clone(),
                    reason: other.to_string(),
                },
            })?;
        log_launch_operation(
            "create",
            &request.image,
            request.name.as_deref(),
            Some(&reference.id),
            "created",
            None,
        );

        let lease = match (&request.name, register_lease) {
            (Some(name), true) => Some(self.reuse.register(
                name,
                reference.clone(),
                true,
                request.hooks.clone(),
            )),
            _ => None,
        };
        let instance = self.instance(request, reference, lease, false);

        if let Err(error) = self.prepare(request, &instance, &executor, contents).await {
            self.discard(&instance, &error).await;
            return Err(error);
        }
        Ok(instance)
    }

    /// Everything between creation and a ready instance
    async fn prepare(
        &self,
        request: &InstanceRequest,
        instance: &Instance,
        executor: &HookExecutor,
        contents: Vec<Vec<u8>>,
    ) -> Result<()> {
        let hooks = &request.hooks;
        executor
            .run_phase(hooks, LifecyclePhase::PostCreate, &instance.hook_context(LifecyclePhase::PostCreate))
            .await?;

        for (file, bytes) in request.files.iter().zip(contents) {
            self.cancellable(
                format!("copying {}", file.destination),
                instance.copy_file(bytes, &file.destination, file.mode),
            )
            .await
            .map_err(|e| match e {
                TestbedError::Cancelled { .. } => e,
                other => TestbedError::FileCopy {
                    instance_id: instance.id().to_string(),
                    destination: file.destination.clone(),
                    reason: other.to_string(),
                },
            })?;
        }

        if !request.started {
            debug!(instance_id = %instance.reference(), "🚀 LAUNCH: created without starting");
            return Ok(());
        }

        executor
            .run_phase(hooks, LifecyclePhase::PreStart, &instance.hook_context(LifecyclePhase::PreStart))
            .await?;
        self.cancellable(
            format!("starting {}", instance.reference()),
            self.runtime.start(instance.reference()),
        )
        .await
        .map_err(|e| match e {
            TestbedError::Cancelled { .. } => e,
            other => TestbedError::Start {
                instance_id: instance.id().to_string(),
                reason: other.to_string(),
            },
        })?;
        executor
            .run_phase(hooks, LifecyclePhase::PostStart, &instance.hook_context(LifecyclePhase::PostStart))
            .await?;

        self.wait_until_ready(request, instance).await?;

        executor
            .run_phase(hooks, LifecyclePhase::PostReady, &instance.hook_context(LifecyclePhase::PostReady))
            .await?;
        for command in &request.after_ready_commands {
            self.run_after_ready(instance, command).await?;
        }

        log_launch_operation(
            "launch",
            &request.image,
            request.name.as_deref(),
            Some(instance.id()),
            "ready",
            None,
        );
        Ok(())
    }

    async fn wait_until_ready(&self, request: &InstanceRequest, instance: &Instance) -> Result<()> {
        let Some(strategy) = &request.wait_strategy else {
            return Ok(());
        };

        let started = Instant::now();
        let ctx = WaitContext::new(self.wait_defaults.clone(), self.cancellation.clone());
        let outcome = strategy.wait_until_ready(instance, &ctx).await;

        let duration_ms = Some(started.elapsed().as_millis() as u64);
        match &outcome {
            Ok(()) => log_wait_operation(&strategy.to_string(), instance.id(), "ready", duration_ms, None),
            Err(error) => log_wait_operation(
                &strategy.to_string(),
                instance.id(),
                "failed",
                duration_ms,
                Some(&error.to_string()),
            ),
        }
        outcome
    }

    async fn run_after_ready(&self, instance: &Instance, command: &[String]) -> Result<()> {
        let rendered = command.join(" ");
        let output = self
            .cancellable(format!("running `{rendered}`"), instance.exec(command))
            .await
            .map_err(|e| match e {
                TestbedError::Cancelled { .. } => e,
                other => TestbedError::hook(LifecyclePhase::PostReady, format!("`{rendered}`: {other}")),
            })?;

        if output.exit_code != 0 {
            return Err(TestbedError::hook(
                LifecyclePhase::PostReady,
                format!(
                    "`{rendered}` exited with code {}: {}",
                    output.exit_code,
                    output.output_lossy().trim()
                ),
            ));
        }
        Ok(())
    }

    /// Dispose of an instance whose launch failed after creation
    async fn discard(&self, instance: &Instance, error: &TestbedError) {
        if !self.cleanup_failed_instances {
            warn!(instance_id = %instance.reference(), error = %error, "⚠️ LAUNCH: leaving failed instance in place");
            instance.abandon().await;
            return;
        }

        match instance.terminate().await {
            Ok(outcome) => {
                debug!(instance_id = %instance.reference(), outcome = ?outcome, "🧹 LAUNCH: cleaned up failed instance")
            }
            Err(cleanup_error) => {
                warn!(
                    instance_id = %instance.reference(),
                    error = %cleanup_error,
                    launch_error = %error,
                    "⚠️ LAUNCH: failed to clean up instance"
                );
                instance.abandon().await;
            }
        }
    }

    fn instance(
        &self,
        request: &InstanceRequest,
        reference: InstanceRef,
        lease: Option<Arc<reuse::Lease>>,
        reused: bool,
    ) -> Instance {
        Instance::new(
            self.runtime.clone(),
            InstanceParts {
                reference,
                name: request.name.clone(),
                image: request.image.clone(),
                exposed_ports: request.exposed_ports.clone(),
                hooks: request.hooks.clone(),
            },
            lease,
            reused,
        )
    }

    /// Race `operation` against this launch's cancellation
    async fn cancellable<T>(
        &self,
        operation: String,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(TestbedError::cancelled(operation)),
            outcome = future => outcome,
        }
    }
}
