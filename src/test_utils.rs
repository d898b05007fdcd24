//! # Test Utilities
//!
//! [`FakeRuntime`] is an in-memory [`RuntimeClient`] for exercising launches
//! without a container engine. It records every call and lets tests script
//! failures, log output over time, exec results and port mappings backed by
//! real local listeners.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::constants::{self, log_frame};
use crate::error::{Result, TestbedError};
use crate::runtime::{CreateSpec, ExecOutput, InstanceRef, LogFraming, LogStream, PortSpec, RuntimeClient};

/// One call received by a [`FakeRuntime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create { image: String, name: Option<String> },
    Start { id: String },
    FindByName { name: String },
    InspectMappedPort { id: String, port: PortSpec },
    InspectHost { id: String },
    FetchLogs { id: String },
    CopyFile { id: String, path: String, mode: u32 },
    Execute { id: String, command: Vec<String> },
    Terminate { id: String },
}

#[derive(Debug, Clone)]
struct FakeInstance {
    spec: CreateSpec,
    started_at: Option<Instant>,
    terminated: bool,
    files: Vec<(String, Vec<u8>, u32)>,
}

#[derive(Debug, Default)]
struct LogScript {
    framing: LogFraming,
    /// Chunks become visible this long after the instance started
    chunks: Vec<(Duration, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<RuntimeCall>,
    instances: HashMap<String, FakeInstance>,
    fail_create: HashSet<String>,
    fail_start: HashSet<String>,
    create_delay: Option<Duration>,
    logs: HashMap<String, LogScript>,
    exec_results: HashMap<String, VecDeque<ExecOutput>>,
    port_mappings: HashMap<u16, u16>,
}

/// In-memory, concurrency-safe runtime client
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
    created: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `create` for `image`
    pub fn fail_create(&self, image: &str) {
        self.state.lock().fail_create.insert(image.to_string());
    }

    /// Reject `start` for instances of `image`
    pub fn fail_start(&self, image: &str) {
        self.state.lock().fail_start.insert(image.to_string());
    }

    /// Make every `create` take at least `delay`
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().create_delay = Some(delay);
    }

    /// Emit `text` on instances of `image` once they have run for `after`
    pub fn script_log(&self, image: &str, after: Duration, text: &str) {
        self.state
            .lock()
            .logs
            .entry(image.to_string())
            .or_default()
            .chunks
            .push((after, text.as_bytes().to_vec()));
    }

    /// Serve the logs of `image` with 8-byte stream headers
    pub fn use_multiplexed_logs(&self, image: &str) {
        self.state
            .lock()
            .logs
            .entry(image.to_string())
            .or_default()
            .framing = LogFraming::Multiplexed;
    }

    /// Queue results for `command`; once drained it exits 0 with no output
    pub fn script_exec(&self, command: &[&str], results: Vec<ExecOutput>) {
        self.state
            .lock()
            .exec_results
            .entry(command.join(" "))
            .or_default()
            .extend(results);
    }

    /// Map container `port` to `host_port` for every instance
    pub fn map_port(&self, port: u16, host_port: u16) {
        self.state.lock().port_mappings.insert(port, host_port);
    }

    /// Bind a local listener and map container `port` to it
    pub async fn listen_on(&self, port: u16) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind((constants::DEFAULT_HOST, 0)).await?;
        self.map_port(port, listener.local_addr()?.port());
        Ok(listener)
    }

    /// Add a running instance named `name` that was not created through this client
    pub fn add_external(&self, image: &str, name: &str) -> InstanceRef {
        let reference = self.allocate_id();
        self.state.lock().instances.insert(
            reference.id.clone(),
            FakeInstance {
                spec: CreateSpec {
                    image: image.to_string(),
                    name: Some(name.to_string()),
                    ..CreateSpec::default()
                },
                started_at: Some(Instant::now()),
                terminated: false,
                files: Vec::new(),
            },
        );
        reference
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    /// Number of successful `create` calls
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst) as usize
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Terminate { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn exec_commands(&self, id: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Execute { id: call_id, command } if call_id == id => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn copied_files(&self, id: &str) -> Vec<(String, Vec<u8>, u32)> {
        self.state
            .lock()
            .instances
            .get(id)
            .map(|instance| instance.files.clone())
            .unwrap_or_default()
    }

    pub fn labels(&self, id: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .instances
            .get(id)
            .map(|instance| instance.spec.labels.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .instances
            .get(id)
            .is_some_and(|instance| instance.started_at.is_some() && !instance.terminated)
    }

    fn allocate_id(&self) -> InstanceRef {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        InstanceRef::new(format!("fake{n:016x}"))
    }

    fn record(&self, call: RuntimeCall) {
        self.state.lock().calls.push(call);
    }

    fn with_instance<T>(
        &self,
        instance: &InstanceRef,
        operation: &str,
        f: impl FnOnce(&mut FakeState, &mut FakeInstance) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let mut entry = match state.instances.get(&instance.id) {
            Some(entry) if !entry.terminated => entry.clone(),
            _ => {
                return Err(TestbedError::runtime(
                    operation,
                    format!("no such instance: {instance}"),
                ))
            }
        };
        let outcome = f(&mut *state, &mut entry);
        state.instances.insert(instance.id.clone(), entry);
        outcome
    }
}

fn frame(chunk: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(log_frame::HEADER_LEN + chunk.len());
    framed.extend_from_slice(&[log_frame::STREAM_STDOUT, 0, 0, 0]);
    framed.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
    framed.extend_from_slice(chunk);
    framed
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn create(&self, spec: &CreateSpec) -> Result<InstanceRef> {
        self.record(RuntimeCall::Create {
            image: spec.image.clone(),
            name: spec.name.clone(),
        });

        let (delay, rejected) = {
            let state = self.state.lock();
            (state.create_delay, state.fail_create.contains(&spec.image))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if rejected {
            return Err(TestbedError::runtime(
                "create",
                format!("image '{}' not found", spec.image),
            ));
        }

        let reference = self.allocate_id();
        self.state.lock().instances.insert(
            reference.id.clone(),
            FakeInstance {
                spec: spec.clone(),
                started_at: None,
                terminated: false,
                files: Vec::new(),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(reference)
    }

    async fn start(&self, instance: &InstanceRef) -> Result<()> {
        self.record(RuntimeCall::Start {
            id: instance.id.clone(),
        });
        self.with_instance(instance, "start", |state, entry| {
            if state.fail_start.contains(&entry.spec.image) {
                return Err(TestbedError::runtime("start", "exit status 1"));
            }
            entry.started_at = Some(Instant::now());
            Ok(())
        })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceRef>> {
        self.record(RuntimeCall::FindByName {
            name: name.to_string(),
        });
        let state = self.state.lock();
        Ok(state
            .instances
            .iter()
            .find(|(_, entry)| !entry.terminated && entry.spec.name.as_deref() == Some(name))
            .map(|(id, _)| InstanceRef::new(id.clone())))
    }

    async fn inspect_mapped_port(&self, instance: &InstanceRef, port: &PortSpec) -> Result<u16> {
        self.record(RuntimeCall::InspectMappedPort {
            id: instance.id.clone(),
            port: *port,
        });
        self.with_instance(instance, "inspect mapped port", |state, _| {
            state.port_mappings.get(&port.port).copied().ok_or_else(|| {
                TestbedError::runtime("inspect mapped port", format!("port {port} is not mapped"))
            })
        })
    }

    async fn inspect_host(&self, instance: &InstanceRef) -> Result<String> {
        self.record(RuntimeCall::InspectHost {
            id: instance.id.clone(),
        });
        self.with_instance(instance, "inspect host", |_, _| {
            Ok(constants::DEFAULT_HOST.to_string())
        })
    }

    async fn fetch_logs(&self, instance: &InstanceRef) -> Result<LogStream> {
        self.record(RuntimeCall::FetchLogs {
            id: instance.id.clone(),
        });
        self.with_instance(instance, "fetch logs", |state, entry| {
            let Some(started_at) = entry.started_at else {
                return Ok(LogStream::default());
            };
            let Some(script) = state.logs.get(&entry.spec.image) else {
                return Ok(LogStream::default());
            };

            let running_for = started_at.elapsed();
            let mut bytes = Vec::new();
            for (after, chunk) in &script.chunks {
                if *after > running_for {
                    continue;
                }
                match script.framing {
                    LogFraming::Raw => bytes.extend_from_slice(chunk),
                    LogFraming::Multiplexed => bytes.extend(frame(chunk)),
                }
            }
            Ok(LogStream {
                bytes,
                framing: script.framing,
            })
        })
    }

    async fn copy_file(
        &self,
        instance: &InstanceRef,
        contents: Vec<u8>,
        path: &str,
        mode: u32,
    ) -> Result<()> {
        self.record(RuntimeCall::CopyFile {
            id: instance.id.clone(),
            path: path.to_string(),
            mode,
        });
        self.with_instance(instance, "copy file", |_, entry| {
            entry.files.push((path.to_string(), contents, mode));
            Ok(())
        })
    }

    async fn execute(&self, instance: &InstanceRef, command: &[String]) -> Result<ExecOutput> {
        self.record(RuntimeCall::Execute {
            id: instance.id.clone(),
            command: command.to_vec(),
        });
        self.with_instance(instance, "execute", |state, _| {
            Ok(state
                .exec_results
                .get_mut(&command.join(" "))
                .and_then(VecDeque::pop_front)
                .unwrap_or_default())
        })
    }

    async fn terminate(&self, instance: &InstanceRef) -> Result<()> {
        self.record(RuntimeCall::Terminate {
            id: instance.id.clone(),
        });
        self.with_instance(instance, "terminate", |_, entry| {
            entry.terminated = true;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_counts_creates() {
        let runtime = FakeRuntime::new();
        let spec = CreateSpec {
            image: "redis:7".to_string(),
            ..CreateSpec::default()
        };

        let instance = runtime.create(&spec).await.unwrap();
        runtime.start(&instance).await.unwrap();
        runtime.terminate(&instance).await.unwrap();

        assert_eq!(runtime.created_count(), 1);
        assert_eq!(runtime.terminated_ids(), vec![instance.id.clone()]);
        assert!(runtime.start(&instance).await.is_err());
        assert_eq!(runtime.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let runtime = FakeRuntime::new();
        runtime.fail_create("missing:latest");
        runtime.fail_start("crashy:1");

        let missing = CreateSpec {
            image: "missing:latest".to_string(),
            ..CreateSpec::default()
        };
        assert!(runtime.create(&missing).await.is_err());

        let crashy = CreateSpec {
            image: "crashy:1".to_string(),
            ..CreateSpec::default()
        };
        let instance = runtime.create(&crashy).await.unwrap();
        assert!(runtime.start(&instance).await.is_err());
        assert!(!runtime.is_running(&instance.id));
    }

    #[tokio::test]
    async fn test_logs_appear_after_start() {
        let runtime = FakeRuntime::new();
        runtime.script_log("pg", Duration::ZERO, "booting\n");
        runtime.script_log("pg", Duration::from_secs(3600), "ready\n");

        let spec = CreateSpec {
            image: "pg".to_string(),
            ..CreateSpec::default()
        };
        let instance = runtime.create(&spec).await.unwrap();
        assert!(runtime.fetch_logs(&instance).await.unwrap().bytes.is_empty());

        runtime.start(&instance).await.unwrap();
        assert_eq!(runtime.fetch_logs(&instance).await.unwrap().bytes, b"booting\n");
    }

    #[tokio::test]
    async fn test_multiplexed_logs_are_framed() {
        let runtime = FakeRuntime::new();
        runtime.use_multiplexed_logs("app");
        runtime.script_log("app", Duration::ZERO, "hi");

        let instance = runtime
            .create(&CreateSpec {
                image: "app".to_string(),
                ..CreateSpec::default()
            })
            .await
            .unwrap();
        runtime.start(&instance).await.unwrap();

        let logs = runtime.fetch_logs(&instance).await.unwrap();
        assert_eq!(logs.framing, LogFraming::Multiplexed);
        assert_eq!(logs.bytes, vec![1, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_find_by_name_sees_external_instances() {
        let runtime = FakeRuntime::new();
        let external = runtime.add_external("postgres:16", "shared-db");

        assert_eq!(runtime.find_by_name("shared-db").await.unwrap(), Some(external));
        assert_eq!(runtime.find_by_name("other").await.unwrap(), None);
        assert_eq!(runtime.created_count(), 0);
    }
}
