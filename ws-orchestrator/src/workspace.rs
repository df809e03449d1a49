use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub status: WorkspaceStatus,
    /// Backend-specific template the VM is created from.
    pub image: String,
    /// Dial address of the guest service, set only while running.
    pub vm_ip: Option<String>,
    /// Set only in [`WorkspaceStatus::Error`].
    pub error_message: Option<String>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Creating => "creating",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Stopping => "stopping",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: WorkspaceStatus) -> bool {
        use WorkspaceStatus::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Stopped, Creating)
                | (Error, Creating)
        )
    }

    /// Conflict unless `self -> next` is an allowed transition.
    pub fn assert_transition(&self, next: WorkspaceStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrchestratorError::Conflict(format!(
                "cannot move workspace from {} to {}",
                self, next
            )))
        }
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guest port exposed through the proxy while the workspace runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub workspace_id: String,
    pub port: u16,
    pub label: Option<String>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,
}

/// How [`crate::WorkspaceService::teardown`] leaves the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// Stop the VM and keep the row as `stopped`.
    Stop,
    /// Destroy the VM and delete the row.
    Delete,
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
