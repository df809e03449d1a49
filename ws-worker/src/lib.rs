//! Background worker for the workspace orchestrator.
//!
//! Pulls lifecycle jobs off the queue one at a time and drives them through
//! the workspace service. The `ws-worker` binary also exposes the request
//! side (create, start, stop, delete, ports) as operator commands.

pub mod app;
pub mod config;
pub mod poll_loop;
pub mod processor;

pub use app::App;
pub use config::{Config, QueueBackend, QueueConfig, WorkerSettings};
pub use poll_loop::PollLoop;
pub use processor::Processor;
