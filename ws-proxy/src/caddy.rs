use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::routes::{self, ProxyAuth};
use crate::{ProxyError, Result, RouteManager};

/// Route manager talking to a Caddy admin endpoint.
pub struct CaddyRouteManager {
    client: Client,
    admin_url: String,
    server: String,
    auth: ProxyAuth,
}

impl CaddyRouteManager {
    pub fn new(client: Client, admin_url: &str, server: &str, auth: ProxyAuth) -> Self {
        Self {
            client,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            server: server.to_string(),
            auth,
        }
    }

    fn routes_url(&self) -> String {
        format!(
            "{}/config/apps/http/servers/{}/routes",
            self.admin_url, self.server
        )
    }

    async fn check(response: Response) -> Result<()> {
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn delete_id(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/id/{}", self.admin_url, id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(id, "route already absent");
            return Ok(());
        }
        Self::check(response).await
    }

    async fn append_route(&self, route: &Value) -> Result<()> {
        let response = self
            .client
            .post(self.routes_url())
            .json(route)
            .send()
            .await?;
        Self::check(response).await
    }

    /// Replace whatever holds these routes' ids, then append them in order.
    async fn replace_routes(&self, routes: [Value; 2], ids: [String; 2]) -> Result<()> {
        for id in &ids {
            self.delete_id(id).await?;
        }
        for route in &routes {
            self.append_route(route).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RouteManager for CaddyRouteManager {
    #[instrument(skip(self))]
    async fn add_workspace_route(&self, name: &str, addr: &str) -> Result<()> {
        self.replace_routes(
            routes::workspace_routes(name, addr, &self.auth),
            [
                routes::workspace_redirect_id(name),
                routes::workspace_route_id(name),
            ],
        )
        .await?;
        info!("workspace route registered");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_workspace_route(&self, name: &str) -> Result<()> {
        self.delete_id(&routes::workspace_route_id(name)).await?;
        self.delete_id(&routes::workspace_redirect_id(name)).await
    }

    #[instrument(skip(self))]
    async fn add_port_route(&self, name: &str, dial: &str, port: u16) -> Result<()> {
        self.replace_routes(
            routes::port_routes(name, dial, port, &self.auth),
            [
                routes::port_redirect_id(name, port),
                routes::port_route_id(name, port),
            ],
        )
        .await?;
        info!("port route registered");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_port_route(&self, name: &str, port: u16) -> Result<()> {
        self.delete_id(&routes::port_route_id(name, port)).await?;
        self.delete_id(&routes::port_redirect_id(name, port)).await
    }

    #[instrument(skip(self, config))]
    async fn bootstrap(&self, config: &Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/load", self.admin_url))
            .json(config)
            .send()
            .await?;
        Self::check(response).await?;
        info!("proxy configuration loaded");
        Ok(())
    }
}
