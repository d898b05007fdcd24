//! # Instance Requests
//!
//! A declarative description of one instance to launch. Requests are built
//! once, optionally adjusted by customizers at launch time, and consumed by the
//! launcher.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::constants;
use crate::error::{Result, TestbedError};
use crate::lifecycle::{Hook, LifecycleHooks, LifecyclePhase};
use crate::runtime::{CreateSpec, PortSpec, Protocol};
use crate::wait::WaitStrategy;

/// Where the bytes of an injected file come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    HostPath(PathBuf),
    Contents(Vec<u8>),
}

/// A file copied into the instance after creation and before start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFile {
    pub source: FileSource,
    pub destination: String,
    pub mode: u32,
}

impl InstanceFile {
    pub fn from_host(path: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: FileSource::HostPath(path.into()),
            destination: destination.into(),
            mode: constants::request::DEFAULT_FILE_MODE,
        }
    }

    pub fn from_bytes(contents: impl Into<Vec<u8>>, destination: impl Into<String>) -> Self {
        Self {
            source: FileSource::Contents(contents.into()),
            destination: destination.into(),
            mode: constants::request::DEFAULT_FILE_MODE,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Read the file contents, from disk if needed
    pub async fn read(&self) -> Result<Vec<u8>> {
        match &self.source {
            FileSource::Contents(bytes) => Ok(bytes.clone()),
            FileSource::HostPath(path) => tokio::fs::read(path).await.map_err(|e| {
                TestbedError::configuration(format!(
                    "cannot read file '{}' for '{}': {e}",
                    path.display(),
                    self.destination
                ))
            }),
        }
    }
}

/// Adjusts a request right before it is launched.
///
/// Customizers run in the order they were attached; an error aborts the launch
/// of that one request before anything is created.
pub trait RequestCustomizer: Send + Sync {
    fn customize(&self, request: &mut InstanceRequest) -> Result<()>;
}

impl<F> RequestCustomizer for F
where
    F: Fn(&mut InstanceRequest) -> Result<()> + Send + Sync,
{
    fn customize(&self, request: &mut InstanceRequest) -> Result<()> {
        self(request)
    }
}

/// One instance to launch
#[derive(Clone)]
pub struct InstanceRequest {
    pub image: String,
    /// Identity used for reuse; required when `reuse` is set
    pub name: Option<String>,
    pub exposed_ports: Vec<PortSpec>,
    pub env: HashMap<String, String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub labels: HashMap<String, String>,
    pub files: Vec<InstanceFile>,
    pub hooks: LifecycleHooks,
    pub wait_strategy: Option<WaitStrategy>,
    /// Commands run inside the instance once it is ready; non-zero exit fails the launch
    pub after_ready_commands: Vec<Vec<String>>,
    pub started: bool,
    pub reuse: bool,
    customizers: Vec<Arc<dyn RequestCustomizer>>,
}

impl fmt::Debug for InstanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRequest")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("exposed_ports", &self.exposed_ports)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("cmd", &self.cmd)
            .field("files", &self.files.len())
            .field("hooks", &self.hooks)
            .field("wait_strategy", &self.wait_strategy)
            .field("started", &self.started)
            .field("reuse", &self.reuse)
            .field("customizers", &self.customizers.len())
            .finish()
    }
}

impl InstanceRequest {
    pub fn builder(image: impl Into<String>) -> InstanceRequestBuilder {
        InstanceRequestBuilder::new(image)
    }

    /// Run the attached customizers in order, consuming them.
    pub fn apply_customizers(&mut self) -> Result<()> {
        let customizers = std::mem::take(&mut self.customizers);
        for customizer in customizers {
            customizer.customize(self).map_err(|e| match e {
                TestbedError::Customization(_) => e,
                other => TestbedError::Customization(other.to_string()),
            })?;
        }
        self.validate()
    }

    /// Check the invariants a launch relies on
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(TestbedError::configuration("image reference must not be empty"));
        }
        if self.reuse && self.name.as_deref().map_or(true, str::is_empty) {
            return Err(TestbedError::configuration(format!(
                "reuse requested for image '{}' without a name",
                self.image
            )));
        }
        if self.reuse && !self.started {
            return Err(TestbedError::configuration(format!(
                "reuse requested for image '{}' but the instance is not started",
                self.image
            )));
        }
        if let Some(strategy) = &self.wait_strategy {
            strategy.validate()?;
            let has_tcp_port = self
                .exposed_ports
                .iter()
                .any(|port| port.protocol == Protocol::Tcp);
            if strategy.uses_first_exposed_port() && !has_tcp_port {
                return Err(TestbedError::configuration(format!(
                    "wait strategy {strategy} needs an exposed tcp port but image '{}' exposes none",
                    self.image
                )));
            }
        }
        Ok(())
    }

    pub fn has_customizers(&self) -> bool {
        !self.customizers.is_empty()
    }

    pub fn create_spec(&self) -> CreateSpec {
        let mut labels = self.labels.clone();
        if let Some(name) = &self.name {
            if self.reuse {
                labels.insert(
                    constants::request::LABEL_REUSE_NAME.to_string(),
                    name.clone(),
                );
            }
        }

        CreateSpec {
            image: self.image.clone(),
            name: self.name.clone(),
            exposed_ports: self.exposed_ports.clone(),
            env: self.env.clone(),
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            labels,
        }
    }

    /// Human-readable identity for logs and failure reports
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} ({})", self.image),
            None => self.image.clone(),
        }
    }
}

/// Builder for [`InstanceRequest`]. Port specs are parsed eagerly and the
/// first invalid one is reported by [`InstanceRequestBuilder::build`].
pub struct InstanceRequestBuilder {
    request: InstanceRequest,
    error: Option<TestbedError>,
}

impl InstanceRequestBuilder {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            request: InstanceRequest {
                image: image.into(),
                name: None,
                exposed_ports: Vec::new(),
                env: HashMap::new(),
                cmd: Vec::new(),
                entrypoint: Vec::new(),
                labels: HashMap::new(),
                files: Vec::new(),
                hooks: LifecycleHooks::new(),
                wait_strategy: None,
                after_ready_commands: Vec::new(),
                started: true,
                reuse: false,
                customizers: Vec::new(),
            },
            error: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.request.name = Some(name.into());
        self
    }

    pub fn exposed_port(mut self, spec: &str) -> Self {
        match spec.parse::<PortSpec>() {
            Ok(port) => self.request.exposed_ports.push(port),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn exposed_ports<'a>(self, specs: impl IntoIterator<Item = &'a str>) -> Self {
        specs.into_iter().fold(self, |builder, spec| builder.exposed_port(spec))
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.env.insert(key.into(), value.into());
        self
    }

    pub fn cmd<S: Into<String>>(mut self, cmd: impl IntoIterator<Item = S>) -> Self {
        self.request.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn entrypoint<S: Into<String>>(mut self, entrypoint: impl IntoIterator<Item = S>) -> Self {
        self.request.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.labels.insert(key.into(), value.into());
        self
    }

    pub fn file(mut self, file: InstanceFile) -> Self {
        self.request.files.push(file);
        self
    }

    pub fn hook(mut self, phase: LifecyclePhase, hook: Hook) -> Self {
        self.request.hooks.add(phase, hook);
        self
    }

    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.request.hooks.extend(hooks);
        self
    }

    pub fn wait_for(mut self, strategy: impl Into<WaitStrategy>) -> Self {
        self.request.wait_strategy = Some(strategy.into());
        self
    }

    pub fn after_ready_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.request
            .after_ready_commands
            .push(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn started(mut self, started: bool) -> Self {
        self.request.started = started;
        self
    }

    pub fn reuse(mut self, reuse: bool) -> Self {
        self.request.reuse = reuse;
        self
    }

    pub fn customize(mut self, customizer: impl RequestCustomizer + 'static) -> Self {
        self.request.customizers.push(Arc::new(customizer));
        self
    }

    pub fn build(self) -> Result<InstanceRequest> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.request.validate()?;
        Ok(self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_builder_defaults() {
        let request = InstanceRequest::builder("nginx")
            .exposed_port("10080/tcp")
            .build()
            .unwrap();

        assert_eq!(request.image, "nginx");
        assert_eq!(request.exposed_ports, vec![PortSpec::tcp(10080)]);
        assert!(request.started);
        assert!(!request.reuse);
        assert!(request.wait_strategy.is_none());
    }

    #[test]
    fn test_invalid_port_rejected_at_build() {
        let err = InstanceRequest::builder("nginx")
            .exposed_port("10080/tcp")
            .exposed_port("not-a-port")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_reuse_requires_name() {
        let err = InstanceRequest::builder("postgres")
            .reuse(true)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let request = InstanceRequest::builder("postgres")
            .name("test-postgres")
            .reuse(true)
            .build()
            .unwrap();
        let spec = request.create_spec();
        assert_eq!(
            spec.labels.get(constants::request::LABEL_REUSE_NAME),
            Some(&"test-postgres".to_string())
        );
    }

    #[test]
    fn test_customizers_apply_in_order() {
        let mut request = InstanceRequest::builder("cockroachdb/cockroach")
            .customize(|req: &mut InstanceRequest| {
                req.env.insert("COCKROACH_USER".into(), "root".into());
                Ok(())
            })
            .customize(|req: &mut InstanceRequest| {
                let user = req.env.get("COCKROACH_USER").cloned().unwrap_or_default();
                req.cmd = vec!["start-single-node".into(), format!("--user={user}")];
                Ok(())
            })
            .build()
            .unwrap();

        assert!(request.has_customizers());
        request.apply_customizers().unwrap();
        assert!(!request.has_customizers());
        assert_eq!(request.cmd[1], "--user=root");
    }

    #[test]
    fn test_customizer_error_is_tagged() {
        let mut request = InstanceRequest::builder("cassandra")
            .customize(|_req: &mut InstanceRequest| {
                Err(TestbedError::configuration("unsupported user with TLS"))
            })
            .build()
            .unwrap();

        let err = request.apply_customizers().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Customization);
        assert!(err.to_string().contains("unsupported user with TLS"));
    }

    #[tokio::test]
    async fn test_file_read_from_bytes_and_disk() {
        let inline = InstanceFile::from_bytes("key=value", "/etc/app.conf").with_mode(0o600);
        assert_eq!(inline.read().await.unwrap(), b"key=value".to_vec());
        assert_eq!(inline.mode, 0o600);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.cql");
        std::fs::write(&path, "CREATE KEYSPACE test;").unwrap();
        let on_disk = InstanceFile::from_host(&path, "/init.cql");
        assert_eq!(on_disk.read().await.unwrap(), b"CREATE KEYSPACE test;".to_vec());

        let missing = InstanceFile::from_host(dir.path().join("nope"), "/nope");
        assert_eq!(missing.read().await.unwrap_err().kind(), ErrorKind::Configuration);
    }
}
