use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{ProxyError, Result, RouteManager};

#[derive(Debug, Default)]
struct State {
    calls: Vec<String>,
    workspaces: BTreeMap<String, String>,
    ports: BTreeMap<(String, u16), String>,
    fail: Vec<&'static str>,
}

/// In-process route table that records every call.
///
/// Used by tests of components that drive a [`RouteManager`]. Operations
/// named through [`RecordingRoutes::with_failure`] return an API error.
#[derive(Debug, Default)]
pub struct RecordingRoutes {
    state: Mutex<State>,
}

impl RecordingRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `op` (`add_workspace`, `remove_workspace`, `add_port`, `remove_port`).
    pub fn with_failure(self, op: &'static str) -> Self {
        self.lock().fail.push(op);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, op: &'static str, call: String) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.fail.contains(&op) {
            return Err(ProxyError::Api {
                status: 500,
                body: format!("injected {} failure", op),
            });
        }
        Ok(())
    }

    /// Calls in order, e.g. `add_workspace demo 127.0.0.1:8080`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn workspace_route(&self, name: &str) -> Option<String> {
        self.lock().workspaces.get(name).cloned()
    }

    /// Upstream registered for `port`.
    pub fn port_route(&self, name: &str, port: u16) -> Option<String> {
        self.lock().ports.get(&(name.to_string(), port)).cloned()
    }

    pub fn port_routes(&self, name: &str) -> Vec<u16> {
        self.lock()
            .ports
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, port)| *port)
            .collect()
    }
}

#[async_trait]
impl RouteManager for RecordingRoutes {
    async fn add_workspace_route(&self, name: &str, addr: &str) -> Result<()> {
        self.record("add_workspace", format!("add_workspace {} {}", name, addr))?;
        self.lock()
            .workspaces
            .insert(name.to_string(), addr.to_string());
        Ok(())
    }

    async fn remove_workspace_route(&self, name: &str) -> Result<()> {
        self.record("remove_workspace", format!("remove_workspace {}", name))?;
        self.lock().workspaces.remove(name);
        Ok(())
    }

    async fn add_port_route(&self, name: &str, dial: &str, port: u16) -> Result<()> {
        self.record("add_port", format!("add_port {} {} {}", name, dial, port))?;
        self.lock()
            .ports
            .insert((name.to_string(), port), dial.to_string());
        Ok(())
    }

    async fn remove_port_route(&self, name: &str, port: u16) -> Result<()> {
        self.record("remove_port", format!("remove_port {} {}", name, port))?;
        self.lock().ports.remove(&(name.to_string(), port));
        Ok(())
    }

    async fn bootstrap(&self, _config: &Value) -> Result<()> {
        self.record("bootstrap", "bootstrap".to_string())
    }
}
