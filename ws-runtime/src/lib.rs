//! Runtime backend abstraction.
//!
//! A [`Runtime`] turns a workspace name into a running VM or container and
//! reports where its primary service can be dialled. Backends differ widely in
//! what else they can do, so optional features live in separate capability
//! traits that callers reach through the accessor methods on [`Runtime`].

// Standard library
use std::collections::BTreeMap;
use std::sync::Arc;

// External crates
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ws_core::{is_tool_installed, Error, Result};
use ws_network::SlotAllocator;

pub mod config;
pub mod docker;
pub mod firecracker;
pub mod guest;
pub mod poll;
pub mod ssh;
pub mod stub;
pub mod tart;

pub use config::{
    DockerConfig, FirecrackerConfig, PollSettings, RuntimeConfig, SshConfig, TartConfig,
};
pub use stub::StubRuntime;

/// Lifecycle state reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    Stopped,
    NotFound,
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeStatus::Running => "running",
            RuntimeStatus::Stopped => "stopped",
            RuntimeStatus::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// Repository to clone into a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Target directory relative to the guest home. Defaults to git's choice.
    #[serde(default)]
    pub directory: Option<String>,
}

/// Push workspace runtime settings into the guest and make them take effect.
#[async_trait]
pub trait Configure: Send + Sync {
    async fn configure(&self, name: &str, env: &BTreeMap<String, String>) -> Result<()>;
}

#[async_trait]
pub trait CloneRepository: Send + Sync {
    /// Clone `repo` into the guest home. `target_addr` is the address
    /// returned by [`Runtime::get_ip`].
    async fn clone_repository(
        &self,
        name: &str,
        target_addr: &str,
        repo: &RepositorySpec,
        token: Option<&str>,
    ) -> Result<()>;
}

/// Byte-exact file access relative to the guest home directory.
#[async_trait]
pub trait GuestFiles: Send + Sync {
    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()>;
}

/// The core contract every backend implements.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Backend identifier (e.g. "docker", "firecracker").
    fn name(&self) -> &'static str;

    async fn create(&self, name: &str, image: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    async fn status(&self, name: &str) -> Result<RuntimeStatus>;

    /// Dial address (`host:port`) of the guest's primary service.
    async fn get_ip(&self, name: &str) -> Result<String>;

    /// Dial address of an arbitrary guest `port`, as seen from the host.
    ///
    /// Backends whose guest has its own routable IP reuse the host of
    /// [`Runtime::get_ip`].
    async fn port_addr(&self, name: &str, port: u16) -> Result<String> {
        let addr = self.get_ip(name).await?;
        Ok(format!("{}:{}", ssh::host_of(&addr), port))
    }

    fn configurer(&self) -> Option<&dyn Configure> {
        None
    }

    fn cloner(&self) -> Option<&dyn CloneRepository> {
        None
    }

    fn files(&self) -> Option<&dyn GuestFiles> {
        None
    }
}

/// Creates the backend selected by `config.backend`.
///
/// The slot allocator is only consulted by backends that manage their own
/// networking.
pub fn get_runtime(config: &RuntimeConfig, slots: Arc<SlotAllocator>) -> Result<Box<dyn Runtime>> {
    match config.backend.as_str() {
        "stub" => Ok(Box::new(StubRuntime::new())),
        "tart" => {
            require_tool(&config.tart.binary)?;
            Ok(Box::new(tart::TartRuntime::new(config)))
        }
        "docker" => {
            require_tool(&config.docker.binary)?;
            Ok(Box::new(docker::DockerRuntime::new(config)))
        }
        "firecracker" => {
            require_tool(&config.firecracker.binary)?;
            Ok(Box::new(firecracker::FirecrackerRuntime::new(config, slots)))
        }
        other => Err(Error::Config(format!("Unknown runtime backend: {}", other))),
    }
}

fn require_tool(binary: &str) -> Result<()> {
    if is_tool_installed(binary) {
        Ok(())
    } else {
        Err(Error::Dependency(binary.to_string()))
    }
}
