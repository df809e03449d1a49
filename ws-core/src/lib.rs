//! Foundation crate for the workspace orchestrator.
//!
//! Holds the error type shared by the runtime and network layers, the
//! external command runner every backend shells out through, and the small
//! validation helpers used at the edges.

pub mod best_effort;
pub mod command;
pub mod error;
pub mod validation;

pub use best_effort::BestEffort;
pub use command::{is_tool_installed, CommandOutput, ExternalCommand};
pub use error::{Error, Result};
