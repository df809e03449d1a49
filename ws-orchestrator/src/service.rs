//! Workspace lifecycle: admission, state transitions and the sequencing of
//! runtime, proxy and queue calls.
//!
//! Request-side operations (`create`, `start`, `stop`, `remove`) only
//! validate, flip status and enqueue. The worker later runs
//! `provision_and_start` or `teardown`, both of which are safe to repeat
//! for a redelivered job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};
use ws_core::validation::{validate_guest_path, validate_workspace_name};
use ws_core::BestEffort;
use ws_proxy::RouteManager;
use ws_queue::{Job, JobKind, JobQueue};
use ws_runtime::{poll::poll_until, RepositorySpec, Runtime, RuntimeStatus};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::store::WorkspaceStore;
use crate::workspace::{Port, TeardownMode, Workspace, WorkspaceStatus};

pub struct WorkspaceService {
    store: WorkspaceStore,
    runtime: Arc<dyn Runtime>,
    routes: Arc<dyn RouteManager>,
    queue: Arc<dyn JobQueue>,
    http: reqwest::Client,
    config: OrchestratorConfig,
}

impl WorkspaceService {
    pub fn new(
        pool: SqlitePool,
        runtime: Arc<dyn Runtime>,
        routes: Arc<dyn RouteManager>,
        queue: Arc<dyn JobQueue>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.health.request_timeout_secs))
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("health client: {}", e)))?;

        Ok(Self {
            store: WorkspaceStore::new(pool),
            runtime,
            routes,
            queue,
            http,
            config,
        })
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn get(&self, id: &str) -> Result<Workspace> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workspace {}", id)))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Workspace> {
        self.store
            .get_by_name(name)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workspace '{}'", name)))
    }

    pub async fn list(&self) -> Result<Vec<Workspace>> {
        self.store.list().await
    }

    async fn check_creating_capacity(&self) -> Result<()> {
        let creating = self.store.count_by_status(WorkspaceStatus::Creating).await?;
        if creating >= i64::from(self.config.max_creating) {
            return Err(OrchestratorError::Conflict(format!(
                "{} workspaces are already being created; try again shortly",
                creating
            )));
        }
        Ok(())
    }

    async fn enqueue(&self, kind: JobKind, id: &str) -> Result<()> {
        self.queue.send(&Job::new(kind, id)).await?;
        debug!(workspace_id = %id, job = %kind, "job enqueued");
        Ok(())
    }

    /// Register a new workspace and queue its provisioning.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, image: &str) -> Result<Workspace> {
        validate_workspace_name(name).map_err(OrchestratorError::invalid)?;
        if image.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "image must not be empty".to_string(),
            ));
        }

        if self.store.get_by_name(name).await?.is_some() {
            return Err(OrchestratorError::Conflict(format!(
                "workspace '{}' already exists",
                name
            )));
        }

        // Count-then-insert: concurrent requests can overshoot by a few.
        let total = self.store.count().await?;
        if total >= i64::from(self.config.max_workspaces) {
            return Err(OrchestratorError::Conflict(format!(
                "workspace limit of {} reached",
                self.config.max_workspaces
            )));
        }
        self.check_creating_capacity().await?;

        let workspace = self.store.insert(name, image).await?;
        if let Err(e) = self.enqueue(JobKind::Create, &workspace.id).await {
            self.set_error(&workspace.id, &format!("failed to queue provisioning: {}", e))
                .await;
            return Err(e);
        }

        info!(workspace_id = %workspace.id, "workspace created");
        Ok(workspace)
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> Result<Workspace> {
        let workspace = self.get(id).await?;
        workspace.status.assert_transition(WorkspaceStatus::Creating)?;
        self.check_creating_capacity().await?;

        if !self
            .store
            .transition(id, workspace.status, WorkspaceStatus::Creating, true)
            .await?
        {
            return Err(OrchestratorError::Conflict(format!(
                "workspace {} changed state concurrently",
                id
            )));
        }
        if let Err(e) = self.enqueue(JobKind::Start, id).await {
            self.set_error(id, &format!("failed to queue start: {}", e))
                .await;
            return Err(e);
        }
        self.get(id).await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<Workspace> {
        let workspace = self.get(id).await?;
        workspace.status.assert_transition(WorkspaceStatus::Stopping)?;

        if !self
            .store
            .transition(id, workspace.status, WorkspaceStatus::Stopping, false)
            .await?
        {
            return Err(OrchestratorError::Conflict(format!(
                "workspace {} changed state concurrently",
                id
            )));
        }
        if let Err(e) = self.enqueue(JobKind::Stop, id).await {
            self.set_error(id, &format!("failed to queue stop: {}", e))
                .await;
            return Err(e);
        }
        self.get(id).await
    }

    /// Queue deletion. The row stays until the worker tears it down.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        let workspace = self.get(id).await?;
        if matches!(
            workspace.status,
            WorkspaceStatus::Running | WorkspaceStatus::Creating
        ) {
            return Err(OrchestratorError::Conflict(format!(
                "workspace '{}' is {}; stop it before deleting",
                workspace.name, workspace.status
            )));
        }
        self.enqueue(JobKind::Delete, id).await
    }

    fn guest_settings(&self, name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "bind-addr".to_string(),
                format!("0.0.0.0:{}", self.config.guest_port),
            ),
            ("auth".to_string(), "none".to_string()),
            ("base-path".to_string(), format!("/ws/{}", name)),
        ])
    }

    async fn wait_healthy(&self, addr: &str) -> Result<()> {
        let url = format!("http://{}{}", addr, self.config.health.path);
        let http = &self.http;
        let url_ref = url.as_str();

        poll_until(self.config.health.poll(), &url, || async move {
            let response = http
                .get(url_ref)
                .send()
                .await
                .map_err(|e| ws_core::Error::Network(e.to_string()))?;
            Ok(response.status().is_success())
        })
        .await
        .map_err(|e| match e {
            ws_core::Error::Timeout(message) => {
                OrchestratorError::Timeout(format!("health check {}", message))
            }
            other => other.into(),
        })
    }

    /// Bring the workspace's VM up and publish it. Safe to repeat.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn provision_and_start(&self, id: &str) -> Result<()> {
        let Some(workspace) = self.store.get(id).await? else {
            info!("workspace no longer exists; nothing to provision");
            return Ok(());
        };
        if !matches!(
            workspace.status,
            WorkspaceStatus::Creating | WorkspaceStatus::Running
        ) {
            info!(status = %workspace.status, "workspace has moved on; skipping provisioning");
            return Ok(());
        }
        let name = workspace.name.as_str();

        match self.runtime.status(name).await? {
            RuntimeStatus::NotFound => {
                self.runtime.create(name, &workspace.image).await?;
                self.runtime.start(name).await?;
            }
            RuntimeStatus::Stopped => self.runtime.start(name).await?,
            RuntimeStatus::Running => debug!(name, "VM already running"),
        }

        let addr = self.runtime.get_ip(name).await?;
        if let Some(configurer) = self.runtime.configurer() {
            configurer.configure(name, &self.guest_settings(name)).await?;
        }
        self.wait_healthy(&addr).await?;
        self.routes.add_workspace_route(name, &addr).await?;

        if self.store.mark_running(id, &addr).await? {
            info!(name, addr = %addr, "workspace running");
        } else {
            warn!(name, "workspace deleted or stopped while provisioning; not marked running");
        }
        Ok(())
    }

    /// Stop or destroy the workspace's VM and unpublish it. Safe to repeat.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn teardown(&self, id: &str, mode: TeardownMode) -> Result<()> {
        let Some(workspace) = self.store.get(id).await? else {
            info!(?mode, "workspace no longer exists; nothing to tear down");
            return Ok(());
        };
        let name = workspace.name.as_str();
        let ports = self.store.list_ports(id).await?;

        match mode {
            TeardownMode::Stop => {
                for port in &ports {
                    self.routes
                        .remove_port_route(name, port.port)
                        .await
                        .best_effort("remove port route");
                }
                self.store.delete_ports(id).await?;

                self.runtime.stop(name).await?;
                self.routes.remove_workspace_route(name).await?;
                self.store
                    .update_state(id, WorkspaceStatus::Stopped, None, None)
                    .await?;
                info!(name, "workspace stopped");
            }
            TeardownMode::Delete => {
                self.runtime.stop(name).await.best_effort("stop VM");
                self.runtime.remove(name).await.best_effort("remove VM");
                for port in &ports {
                    self.routes
                        .remove_port_route(name, port.port)
                        .await
                        .best_effort("remove port route");
                }
                self.routes
                    .remove_workspace_route(name)
                    .await
                    .best_effort("remove workspace route");
                self.store.delete(id).await?;
                info!(name, "workspace deleted");
            }
        }
        Ok(())
    }

    /// Record a failure on the workspace. Never fails itself.
    #[instrument(skip(self, message), fields(workspace_id = %id))]
    pub async fn set_error(&self, id: &str, message: &str) {
        match self
            .store
            .update_state(id, WorkspaceStatus::Error, None, Some(message))
            .await
        {
            Ok(true) => warn!(error = %message, "workspace marked as failed"),
            Ok(false) => debug!("workspace gone; error not recorded"),
            Err(e) => warn!(error = %e, "could not record workspace error"),
        }
    }

    async fn running(&self, id: &str) -> Result<(Workspace, String)> {
        let workspace = self.get(id).await?;
        match (workspace.status, workspace.vm_ip.clone()) {
            (WorkspaceStatus::Running, Some(addr)) => Ok((workspace, addr)),
            _ => Err(OrchestratorError::Conflict(format!(
                "workspace '{}' is {}, not running",
                workspace.name, workspace.status
            ))),
        }
    }

    /// Expose guest `port` under `/ws/<name>/ports/<port>/`.
    #[instrument(skip(self))]
    pub async fn add_port(&self, id: &str, port: u16, label: Option<&str>) -> Result<Port> {
        if port == 0 {
            return Err(OrchestratorError::InvalidInput(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        let (workspace, _) = self.running(id).await?;

        let exposed = self.store.count_ports(id).await?;
        if exposed >= i64::from(self.config.max_ports) {
            return Err(OrchestratorError::Conflict(format!(
                "workspace '{}' already exposes {} ports",
                workspace.name, exposed
            )));
        }

        let dial = self.runtime.port_addr(&workspace.name, port).await?;
        let record = self.store.insert_port(id, port, label).await?;
        if let Err(e) = self.routes.add_port_route(&workspace.name, &dial, port).await {
            self.store
                .delete_port(id, port)
                .await
                .best_effort("roll back port row");
            return Err(e.into());
        }
        info!(name = %workspace.name, port, "port exposed");
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn remove_port(&self, id: &str, port: u16) -> Result<()> {
        let (workspace, _) = self.running(id).await?;
        if !self
            .store
            .list_ports(id)
            .await?
            .iter()
            .any(|p| p.port == port)
        {
            return Err(OrchestratorError::NotFound(format!(
                "port {} on workspace '{}'",
                port, workspace.name
            )));
        }

        self.routes.remove_port_route(&workspace.name, port).await?;
        self.store.delete_port(id, port).await?;
        info!(name = %workspace.name, port, "port removed");
        Ok(())
    }

    pub async fn list_ports(&self, id: &str) -> Result<Vec<Port>> {
        self.get(id).await?;
        self.store.list_ports(id).await
    }

    #[instrument(skip(self, token), fields(url = %repo.url))]
    pub async fn clone_repository(
        &self,
        id: &str,
        repo: &RepositorySpec,
        token: Option<&str>,
    ) -> Result<()> {
        if repo.url.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "repository URL must not be empty".to_string(),
            ));
        }
        if let Some(directory) = &repo.directory {
            validate_guest_path(directory).map_err(OrchestratorError::invalid)?;
        }
        let (workspace, addr) = self.running(id).await?;
        let cloner = self
            .runtime
            .cloner()
            .ok_or_else(|| self.unsupported("cloning repositories"))?;
        cloner
            .clone_repository(&workspace.name, &addr, repo, token)
            .await?;
        Ok(())
    }

    pub async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        validate_guest_path(path).map_err(OrchestratorError::invalid)?;
        let (workspace, _) = self.running(id).await?;
        let files = self
            .runtime
            .files()
            .ok_or_else(|| self.unsupported("guest file access"))?;
        Ok(files.read_file(&workspace.name, path).await?)
    }

    #[instrument(skip(self, contents), fields(bytes = contents.len()))]
    pub async fn write_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<()> {
        validate_guest_path(path).map_err(OrchestratorError::invalid)?;
        let (workspace, _) = self.running(id).await?;
        let files = self
            .runtime
            .files()
            .ok_or_else(|| self.unsupported("guest file access"))?;
        files.write_file(&workspace.name, path, contents).await?;
        Ok(())
    }

    fn unsupported(&self, what: &str) -> OrchestratorError {
        OrchestratorError::Unsupported(format!(
            "the {} backend does not support {}",
            self.runtime.name(),
            what
        ))
    }
}
