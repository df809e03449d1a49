//! Workspace orchestration business logic
//!
//! Persists workspaces and their exposed ports, enforces the status state
//! machine and admission limits, and sequences runtime, proxy and queue
//! calls. The worker binary drives it; an HTTP layer could use it the same
//! way.

pub mod config;
pub mod db;
pub mod error;
pub mod service;
pub mod store;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{HealthConfig, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use service::WorkspaceService;
pub use store::WorkspaceStore;
pub use workspace::{Port, TeardownMode, Workspace, WorkspaceStatus};
