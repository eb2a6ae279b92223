//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use switchyard::{Server, ServerConfig, ServerTask, Shutdown};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Loopback configuration on an ephemeral port with a short grace window.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::with_bind_address("127.0.0.1:0");
    config.timeouts.shutdown_grace_ms = 500;
    config.timeouts.upgrade_grace_ms = 200;
    config
}

/// A started server plus the coordinator that stops it.
pub struct Running {
    pub server: Server,
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: ServerTask,
}

impl Running {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Trigger the coordinator and wait for the run to end.
    pub async fn stop(self) -> switchyard::Cancelled {
        self.shutdown.trigger();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not stop in time")
            .expect("server run failed")
    }
}

pub async fn start(server: Server) -> Running {
    let shutdown = Shutdown::new();
    let task = server
        .start(shutdown.subscribe())
        .await
        .expect("server should start");
    Running {
        addr: task.local_addr(),
        server,
        shutdown,
        task,
    }
}

/// Client without connection reuse, so every request opens a fresh connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(WAIT)
        .build()
        .expect("client should build")
}

/// Extract `name=value` from a `Set-Cookie` header.
pub fn set_cookie_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
}
