// External crates
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

// Internal imports
use ws_orchestrator::db::backup_database;
use ws_orchestrator::{OrchestratorError, Workspace, WorkspaceService};
use ws_proxy::RouteManager;
use ws_worker::{App, Config};

#[derive(Parser)]
#[command(name = "ws-worker")]
#[command(about = "Workspace orchestration worker and operator commands")]
#[command(version)]
pub struct Args {
    /// YAML configuration file
    #[arg(long, global = true, env = "WS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Process queued jobs until interrupted
    Run,
    /// Register a workspace and queue its provisioning
    Create {
        /// Hostname-safe workspace name
        name: String,
        /// Backend image or template
        image: String,
    },
    /// Queue a start for a stopped or failed workspace
    Start {
        /// Workspace id or name
        workspace: String,
    },
    /// Queue a stop for a running workspace
    Stop {
        /// Workspace id or name
        workspace: String,
    },
    /// Queue deletion of a stopped or failed workspace
    Delete {
        /// Workspace id or name
        workspace: String,
    },
    /// List all workspaces
    List,
    /// Manage exposed guest ports
    #[command(subcommand)]
    Port(PortCommand),
    /// Manage the reverse proxy
    #[command(subcommand)]
    Proxy(ProxyCommand),
}

#[derive(Subcommand)]
pub enum PortCommand {
    /// Expose a guest port under /ws/<name>/ports/<port>/
    Add {
        workspace: String,
        port: u16,
        #[arg(long)]
        label: Option<String>,
    },
    /// Stop exposing a guest port
    Remove { workspace: String, port: u16 },
    /// List exposed ports
    List { workspace: String },
}

#[derive(Subcommand)]
pub enum ProxyCommand {
    /// Load a full proxy configuration from a JSON file
    Bootstrap { file: PathBuf },
}

/// Look a workspace up by id, falling back to its name.
async fn resolve(service: &WorkspaceService, key: &str) -> Result<Workspace> {
    match service.get(key).await {
        Ok(workspace) => Ok(workspace),
        Err(OrchestratorError::NotFound(_)) => Ok(service.get_by_name(key).await?),
        Err(e) => Err(e.into()),
    }
}

fn print_workspace(workspace: &Workspace) {
    println!(
        "{:<36}  {:<20}  {:<9}  {:<21}  {}",
        workspace.id,
        workspace.name,
        workspace.status,
        workspace.vm_ip.as_deref().unwrap_or("-"),
        workspace.error_message.as_deref().unwrap_or("")
    );
}

async fn run_worker(config: &Config) -> Result<()> {
    if config.db_path.exists() {
        let backup_path = backup_database(&config.db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let app = App::build(config).await?;
    let poll_loop = app.poll_loop(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested; finishing current job");
        }
        let _ = shutdown_tx.send(true);
    });

    poll_loop.run(shutdown_rx).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = ws_logging::init_subscriber();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Command::Run = args.command {
        return run_worker(&config).await;
    }

    let app = App::build(&config).await?;
    let service = &app.service;

    match args.command {
        Command::Run => {}
        Command::Create { name, image } => {
            let workspace = service.create(&name, &image).await?;
            println!("Created workspace '{}' ({})", workspace.name, workspace.id);
        }
        Command::Start { workspace } => {
            let workspace = resolve(service, &workspace).await?;
            service.start(&workspace.id).await?;
            println!("Start queued for '{}'", workspace.name);
        }
        Command::Stop { workspace } => {
            let workspace = resolve(service, &workspace).await?;
            service.stop(&workspace.id).await?;
            println!("Stop queued for '{}'", workspace.name);
        }
        Command::Delete { workspace } => {
            let workspace = resolve(service, &workspace).await?;
            service.remove(&workspace.id).await?;
            println!("Deletion queued for '{}'", workspace.name);
        }
        Command::List => {
            for workspace in service.list().await? {
                print_workspace(&workspace);
            }
        }
        Command::Port(PortCommand::Add {
            workspace,
            port,
            label,
        }) => {
            let workspace = resolve(service, &workspace).await?;
            service
                .add_port(&workspace.id, port, label.as_deref())
                .await?;
            println!("Exposed /ws/{}/ports/{}/", workspace.name, port);
        }
        Command::Port(PortCommand::Remove { workspace, port }) => {
            let workspace = resolve(service, &workspace).await?;
            service.remove_port(&workspace.id, port).await?;
            println!("Removed port {} from '{}'", port, workspace.name);
        }
        Command::Port(PortCommand::List { workspace }) => {
            let workspace = resolve(service, &workspace).await?;
            for port in service.list_ports(&workspace.id).await? {
                println!("{:<6}  {}", port.port, port.label.as_deref().unwrap_or(""));
            }
        }
        Command::Proxy(ProxyCommand::Bootstrap { file }) => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let proxy_config: serde_json::Value =
                serde_json::from_str(&contents).context("Proxy configuration is not JSON")?;
            app.routes.bootstrap(&proxy_config).await?;
            println!("Proxy configuration loaded from {}", file.display());
        }
    }

    Ok(())
}
