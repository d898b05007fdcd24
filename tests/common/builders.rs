//! Shared launcher and request builders for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use testbed_core::test_utils::FakeRuntime;
use testbed_core::wait::LogStrategy;
use testbed_core::{wait, ConfigManager, InstanceRequest, Launcher, TestbedConfig};

pub const FAST_POLL: Duration = Duration::from_millis(10);

/// Configuration with short polling so tests finish quickly
pub fn fast_config() -> TestbedConfig {
    let mut config = TestbedConfig::default();
    config.wait.poll_interval_ms = 10;
    config.wait.startup_timeout_ms = 2_000;
    config
}

/// A launcher over a fresh [`FakeRuntime`]
pub fn fake_launcher() -> (Arc<FakeRuntime>, Launcher) {
    testbed_core::logging::init_structured_logging();
    let runtime = Arc::new(FakeRuntime::new());
    let manager = ConfigManager::from_config(fast_config()).expect("fast config is valid");
    let launcher = Launcher::with_config(runtime.clone(), manager);
    (runtime, launcher)
}

pub fn simple_request(image: &str) -> InstanceRequest {
    InstanceRequest::builder(image)
        .build()
        .expect("simple request is valid")
}

/// Log strategy that polls fast and gives up after `timeout`
pub fn log_within(pattern: &str, timeout: Duration) -> LogStrategy {
    wait::for_log(pattern)
        .with_poll_interval(FAST_POLL)
        .with_startup_timeout(timeout)
}

pub fn reuse_request(image: &str, name: &str) -> InstanceRequest {
    InstanceRequest::builder(image)
        .name(name)
        .reuse(true)
        .build()
        .expect("reuse request is valid")
}

/// Answer every HTTP request on `listener` with `status` and `body`
pub fn serve_http(listener: tokio::net::TcpListener, status: u16, body: &'static str) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                let _ = socket.read(&mut buffer).await;
                let response = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
}

/// Accept connections and drop them immediately
pub fn serve_and_hang_up(listener: tokio::net::TcpListener) {
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });
}
