use serde::{Deserialize, Serialize};
use ws_runtime::PollSettings;

/// Admission limits and readiness probing for [`crate::WorkspaceService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Workspaces that may exist at once, in any state.
    pub max_workspaces: u32,
    /// Workspaces that may be `creating` at once.
    pub max_creating: u32,
    /// Exposed ports per workspace.
    pub max_ports: u32,
    /// Port the guest service listens on.
    pub guest_port: u16,
    pub health: HealthConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workspaces: 20,
            max_creating: 3,
            max_ports: 10,
            guest_port: 8080,
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub path: String,
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval_ms: 2000,
            max_attempts: 90,
            request_timeout_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn poll(&self) -> PollSettings {
        PollSettings {
            interval_ms: self.interval_ms,
            max_attempts: self.max_attempts,
        }
    }
}
