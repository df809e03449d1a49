//! Backend settings.
//!
//! All structs deserialize with defaults so a configuration file only needs
//! to name the values it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// One of `stub`, `tart`, `docker`, `firecracker`.
    pub backend: String,
    /// Port of the guest's primary service (the IDE server).
    pub guest_port: u16,
    pub poll: PollSettings,
    pub ssh: SshConfig,
    pub tart: TartConfig,
    pub docker: DockerConfig,
    pub firecracker: FirecrackerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: "docker".to_string(),
            guest_port: 8080,
            poll: PollSettings::default(),
            ssh: SshConfig::default(),
            tart: TartConfig::default(),
            docker: DockerConfig::default(),
            firecracker: FirecrackerConfig::default(),
        }
    }
}

/// Interval × attempt budget for every wait a backend performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// Guest config file written by `configure`, relative to the guest home.
    pub config_path: String,
    /// Shell command that restarts the guest service after `configure`.
    pub restart_command: String,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            user: "admin".to_string(),
            port: 22,
            identity_file: None,
            config_path: ".config/code-server/config.yaml".to_string(),
            restart_command: "sudo systemctl restart code-server".to_string(),
            command_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TartConfig {
    pub binary: String,
    /// Where detached `tart run` output is appended.
    pub log_dir: PathBuf,
}

impl Default for TartConfig {
    fn default() -> Self {
        Self {
            binary: "tart".to_string(),
            log_dir: std::env::temp_dir().join("ws-tart"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub binary: String,
    /// User for `docker exec`; the image default when unset.
    pub exec_user: Option<String>,
    /// Guest config file written by `configure`, relative to the guest home.
    pub config_path: String,
    pub command_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            exec_user: None,
            config_path: ".config/code-server/config.yaml".to_string(),
            command_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub binary: String,
    pub kernel_path: PathBuf,
    /// Base images live at `<images_dir>/<image>.ext4`.
    pub images_dir: PathBuf,
    /// Per-VM working directories live at `<vms_dir>/<name>`.
    pub vms_dir: PathBuf,
    /// Privileged script managing TAP devices.
    pub tap_helper: PathBuf,
    pub use_sudo: bool,
    pub bridge: String,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub pgrep_binary: String,
    pub shutdown_timeout_secs: u64,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".ws")
            .join("firecracker");
        Self {
            binary: "firecracker".to_string(),
            kernel_path: base.join("vmlinux"),
            images_dir: base.join("images"),
            vms_dir: base.join("vms"),
            tap_helper: PathBuf::from("/usr/local/bin/ws-tap-helper"),
            use_sudo: true,
            bridge: "wsbr0".to_string(),
            vcpu_count: 2,
            mem_size_mib: 2048,
            pgrep_binary: "pgrep".to_string(),
            shutdown_timeout_secs: 10,
        }
    }
}
