//! Dynamic reverse-proxy routes for running workspaces.
//!
//! Routes are added and removed one workspace (or one port) at a time
//! against the Caddy admin API. Every operation is safe to repeat: adds
//! delete any route holding the same ids first, and removing a route that
//! is already gone succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod caddy;
pub mod recording;
pub mod routes;

pub use caddy::CaddyRouteManager;
pub use recording::RecordingRoutes;
pub use routes::ProxyAuth;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy admin request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Proxy admin API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid proxy configuration: {0}")]
    Config(String),
}

#[async_trait]
pub trait RouteManager: Send + Sync {
    /// Route `/ws/<name>/` to `addr` (`host:port`).
    async fn add_workspace_route(&self, name: &str, addr: &str) -> Result<()>;

    async fn remove_workspace_route(&self, name: &str) -> Result<()>;

    /// Route `/ws/<name>/ports/<port>/` to `dial`, the proxy-reachable
    /// address of guest `port`.
    async fn add_port_route(&self, name: &str, dial: &str, port: u16) -> Result<()>;

    async fn remove_port_route(&self, name: &str, port: u16) -> Result<()>;

    /// Replace the proxy's whole configuration.
    async fn bootstrap(&self, config: &Value) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Admin API base URL; routing is disabled when unset.
    pub admin_url: Option<String>,
    /// Server block the routes are appended to.
    pub server: String,
    pub auth: ProxyAuth,
    pub timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: None,
            server: "srv0".to_string(),
            auth: ProxyAuth::None,
            timeout_secs: 10,
        }
    }
}

/// Route manager for `config`; a [`DisabledRoutes`] when no admin URL is set.
pub fn build_route_manager(config: &ProxyConfig) -> Result<Arc<dyn RouteManager>> {
    match config.admin_url.as_deref() {
        None | Some("") => {
            tracing::info!("No proxy admin URL configured; workspace routing disabled");
            Ok(Arc::new(DisabledRoutes))
        }
        Some(url) => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?;
            Ok(Arc::new(CaddyRouteManager::new(
                client,
                url,
                &config.server,
                config.auth.clone(),
            )))
        }
    }
}

/// Accepts every call and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRoutes;

#[async_trait]
impl RouteManager for DisabledRoutes {
    async fn add_workspace_route(&self, name: &str, addr: &str) -> Result<()> {
        tracing::debug!(name, addr, "routing disabled; skipping workspace route");
        Ok(())
    }

    async fn remove_workspace_route(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn add_port_route(&self, name: &str, _dial: &str, port: u16) -> Result<()> {
        tracing::debug!(name, port, "routing disabled; skipping port route");
        Ok(())
    }

    async fn remove_port_route(&self, _name: &str, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn bootstrap(&self, _config: &Value) -> Result<()> {
        Err(ProxyError::Config(
            "cannot bootstrap: no proxy admin URL configured".to_string(),
        ))
    }
}
