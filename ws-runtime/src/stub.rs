//! In-memory backend for tests and local development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use ws_core::{Error, Result};

use crate::{CloneRepository, Configure, GuestFiles, RepositorySpec, Runtime, RuntimeStatus};

#[derive(Debug, Default)]
struct StubState {
    /// name -> running
    vms: HashMap<String, bool>,
    calls: Vec<String>,
    configured: HashMap<String, BTreeMap<String, String>>,
    cloned: Vec<(String, RepositorySpec)>,
    files: HashMap<(String, String), Vec<u8>>,
}

/// Backend whose transitions are instant and whose calls are recorded.
///
/// `calls()` lists the mutating operations in order (`create`, `start`,
/// `stop`, `remove`, `configure`, `clone`, `read_file`, `write_file`);
/// `status` and `get_ip` are not recorded.
#[derive(Debug)]
pub struct StubRuntime {
    state: Mutex<StubState>,
    guest_capabilities: bool,
    address: String,
    failing: HashSet<String>,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StubRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            guest_capabilities: false,
            address: "127.0.0.1:8080".to_string(),
            failing: HashSet::new(),
        }
    }

    /// Enable configure, clone and file capabilities.
    pub fn with_guest_capabilities(mut self) -> Self {
        self.guest_capabilities = true;
        self
    }

    /// Address returned by `get_ip` for every VM.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Make `operation` fail for every VM.
    pub fn with_failure(mut self, operation: &str) -> Self {
        self.failing.insert(operation.to_string());
        self
    }

    /// Pre-register a VM as if created outside the orchestrator.
    pub fn with_vm(self, name: &str, running: bool) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.vms.insert(name.to_string(), running);
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn configured_env(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.configured.get(name).cloned())
    }

    pub fn cloned(&self) -> Vec<(String, RepositorySpec)> {
        self.state
            .lock()
            .map(|s| s.cloned.clone())
            .unwrap_or_default()
    }

    fn record(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, StubState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("stub runtime state poisoned".into()))?;
        state.calls.push(operation.to_string());
        if self.failing.contains(operation) {
            return Err(Error::Runtime(format!("stub {} failure", operation)));
        }
        Ok(state)
    }

    fn require_vm(state: &StubState, name: &str) -> Result<()> {
        if state.vms.contains_key(name) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("vm '{}'", name)))
        }
    }
}

#[async_trait]
impl Runtime for StubRuntime {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn create(&self, name: &str, _image: &str) -> Result<()> {
        let mut state = self.record("create")?;
        if state.vms.contains_key(name) {
            return Err(Error::Runtime(format!("vm '{}' already exists", name)));
        }
        state.vms.insert(name.to_string(), false);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut state = self.record("start")?;
        Self::require_vm(&state, name)?;
        state.vms.insert(name.to_string(), true);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut state = self.record("stop")?;
        Self::require_vm(&state, name)?;
        state.vms.insert(name.to_string(), false);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.record("remove")?;
        state.vms.remove(name);
        state.files.retain(|(vm, _), _| vm != name);
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<RuntimeStatus> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("stub runtime state poisoned".into()))?;
        Ok(match state.vms.get(name) {
            Some(true) => RuntimeStatus::Running,
            Some(false) => RuntimeStatus::Stopped,
            None => RuntimeStatus::NotFound,
        })
    }

    async fn get_ip(&self, name: &str) -> Result<String> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("stub runtime state poisoned".into()))?;
        Self::require_vm(&state, name)?;
        Ok(self.address.clone())
    }

    fn configurer(&self) -> Option<&dyn Configure> {
        self.guest_capabilities.then_some(self as &dyn Configure)
    }

    fn cloner(&self) -> Option<&dyn CloneRepository> {
        self.guest_capabilities.then_some(self as &dyn CloneRepository)
    }

    fn files(&self) -> Option<&dyn GuestFiles> {
        self.guest_capabilities.then_some(self as &dyn GuestFiles)
    }
}

#[async_trait]
impl Configure for StubRuntime {
    async fn configure(&self, name: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.record("configure")?;
        state.configured.insert(name.to_string(), env.clone());
        Ok(())
    }
}

#[async_trait]
impl CloneRepository for StubRuntime {
    async fn clone_repository(
        &self,
        name: &str,
        _target_addr: &str,
        repo: &RepositorySpec,
        _token: Option<&str>,
    ) -> Result<()> {
        let mut state = self.record("clone")?;
        state.cloned.push((name.to_string(), repo.clone()));
        Ok(())
    }
}

#[async_trait]
impl GuestFiles for StubRuntime {
    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.record("read_file")?;
        state
            .files
            .get(&(name.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("guest file '{}'", path)))
    }

    async fn write_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()> {
        let mut state = self.record("write_file")?;
        state
            .files
            .insert((name.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_records_calls() {
        let runtime = StubRuntime::new();
        assert_eq!(runtime.status("demo").await.unwrap(), RuntimeStatus::NotFound);

        runtime.create("demo", "ubuntu").await.unwrap();
        assert_eq!(runtime.status("demo").await.unwrap(), RuntimeStatus::Stopped);
        runtime.start("demo").await.unwrap();
        assert_eq!(runtime.status("demo").await.unwrap(), RuntimeStatus::Running);
        runtime.stop("demo").await.unwrap();
        runtime.remove("demo").await.unwrap();

        assert_eq!(runtime.calls(), vec!["create", "start", "stop", "remove"]);
        assert_eq!(runtime.status("demo").await.unwrap(), RuntimeStatus::NotFound);
    }

    #[tokio::test]
    async fn test_capabilities_disabled_by_default() {
        let runtime = StubRuntime::new();
        assert!(runtime.configurer().is_none());
        assert!(runtime.cloner().is_none());
        assert!(runtime.files().is_none());

        let capable = StubRuntime::new().with_guest_capabilities();
        assert!(capable.configurer().is_some());
        assert!(capable.files().is_some());
    }

    #[tokio::test]
    async fn test_files_are_byte_exact() {
        let runtime = StubRuntime::new().with_guest_capabilities();
        let files = runtime.files().unwrap();
        files.write_file("demo", "bin/blob", &[0, 159, 255]).await.unwrap();
        assert_eq!(files.read_file("demo", "bin/blob").await.unwrap(), vec![0, 159, 255]);
        assert!(matches!(
            files.read_file("demo", "missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_is_still_recorded() {
        let runtime = StubRuntime::new().with_vm("demo", true).with_failure("stop");
        assert!(runtime.stop("demo").await.is_err());
        assert_eq!(runtime.calls(), vec!["stop"]);
        assert_eq!(runtime.status("demo").await.unwrap(), RuntimeStatus::Running);
    }
}
