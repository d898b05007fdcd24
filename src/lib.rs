#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Testbed Core
//!
//! Orchestration and readiness engine for throwaway test instances.
//!
//! ## Overview
//!
//! Testbed Core turns declarative [`InstanceRequest`]s into running, ready
//! instances through a pluggable [`RuntimeClient`]. It never talks to a
//! container engine itself: creation, start, inspection and removal are all
//! delegated to the runtime client.
//!
//! ## Key Features
//!
//! - **Readiness strategies**: log occurrence, listening port, HTTP, exec, SQL
//!   and all-of composition, each with its own timeout and poll interval
//! - **Lifecycle hooks**: ordered callbacks around create, start, readiness and
//!   termination that can abort the transition
//! - **Parallel launching**: a batch launches every request concurrently and
//!   reports each failure by submission index without disturbing its siblings
//! - **Reuse**: requests with the same name share one instance
//!
//! ## Module Organization
//!
//! - [`request`] - Instance requests and their builder
//! - [`wait`] - Readiness strategies
//! - [`lifecycle`] - Lifecycle phases and the hook executor
//! - [`launcher`] - Parallel launcher and batch error aggregation
//! - [`instance`] - Handles to launched instances
//! - [`runtime`] - The runtime client boundary
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testbed_core::{wait, InstanceRequest, LaunchOptions, Launcher, RuntimeClient};
//!
//! # async fn example(runtime: Arc<dyn RuntimeClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let launcher = Launcher::new(runtime);
//!
//! let requests = vec![
//!     InstanceRequest::builder("postgres:16")
//!         .exposed_port("5432/tcp")
//!         .env("POSTGRES_PASSWORD", "postgres")
//!         .wait_for(wait::for_log("database system is ready to accept connections").with_occurrence(2))
//!         .build()?,
//!     InstanceRequest::builder("redis:7")
//!         .exposed_port("6379/tcp")
//!         .wait_for(wait::for_listening_port("6379/tcp"))
//!         .build()?,
//! ];
//!
//! let outcome = launcher.launch_all(requests, &LaunchOptions::default()).await;
//! for instance in &outcome.instances {
//!     println!("{} ready at {}", instance.image(), instance.host().await?);
//! }
//! if let Some(error) = outcome.error {
//!     eprintln!("{error}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod instance;
pub mod launcher;
pub mod lifecycle;
pub mod logging;
pub mod request;
pub mod runtime;
pub mod test_utils;
pub mod wait;

pub use config::{ConfigManager, LauncherConfig, TestbedConfig, WaitConfig};
pub use error::{ErrorKind, Result, TestbedError};
pub use instance::{Instance, TerminateOutcome};
pub use launcher::{BatchLaunchError, BatchOutcome, LaunchFailure, LaunchOptions, Launcher};
pub use lifecycle::{hook, HookContext, HookExecutor, LifecycleHooks, LifecyclePhase};
pub use request::{InstanceFile, InstanceRequest, RequestCustomizer};
pub use runtime::{CreateSpec, ExecOutput, InstanceRef, LogStream, PortSpec, Protocol, RuntimeClient};
pub use wait::{StrategyTarget, WaitContext, WaitStrategy};
