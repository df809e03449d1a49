//! Worker configuration.
//!
//! Every value has a default, most of them overridable through a `WS_*`
//! environment variable. A YAML file passed with `--config` (or named by
//! `WS_CONFIG`) replaces the defaults of whatever sections it contains.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use ws_orchestrator::{HealthConfig, OrchestratorConfig};
use ws_proxy::ProxyConfig;
use ws_queue::SqliteQueueConfig;
use ws_runtime::RuntimeConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Slot table for the Firecracker backend.
    #[serde(default = "default_slots_path")]
    pub slots_path: PathBuf,

    #[serde(default = "default_queue")]
    pub queue: QueueConfig,

    #[serde(default = "default_orchestrator")]
    pub orchestrator: OrchestratorConfig,

    #[serde(default = "default_proxy")]
    pub proxy: ProxyConfig,

    #[serde(default = "default_runtime")]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Durable queue in SQLite; survives restarts and redelivers.
    Sqlite,
    /// Process-local queue; jobs are lost on exit.
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(QueueBackend::Sqlite),
            "memory" => Ok(QueueBackend::Memory),
            other => Err(format!("unknown queue backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,
    /// Separate database for the queue; defaults to the workspace database.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(flatten)]
    pub sqlite: SqliteQueueConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Pause after an infrastructure error in the poll loop.
    pub error_backoff_ms: u64,
    /// Pause after an empty receive.
    pub idle_delay_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            error_backoff_ms: 5000,
            idle_delay_ms: 200,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn ws_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ws")
}

fn default_db_path() -> PathBuf {
    std::env::var("WS_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| ws_home().join("ws.db"))
}

fn default_slots_path() -> PathBuf {
    std::env::var("WS_SLOTS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| ws_home().join("slots.json"))
}

fn default_queue_backend() -> QueueBackend {
    env_parse("WS_QUEUE_BACKEND").unwrap_or(QueueBackend::Sqlite)
}

fn default_queue() -> QueueConfig {
    let mut sqlite = SqliteQueueConfig::default();
    if let Some(wait) = env_parse("WS_QUEUE_WAIT_SECS") {
        sqlite.wait_time_secs = wait;
    }
    if let Some(visibility) = env_parse("WS_QUEUE_VISIBILITY_SECS") {
        sqlite.visibility_timeout_secs = visibility;
    }

    QueueConfig {
        backend: default_queue_backend(),
        path: std::env::var("WS_QUEUE_PATH").ok().map(PathBuf::from),
        sqlite,
    }
}

fn default_orchestrator() -> OrchestratorConfig {
    let defaults = OrchestratorConfig::default();
    OrchestratorConfig {
        max_workspaces: env_parse("WS_MAX_WORKSPACES").unwrap_or(defaults.max_workspaces),
        max_creating: env_parse("WS_MAX_CREATING").unwrap_or(defaults.max_creating),
        max_ports: env_parse("WS_MAX_PORTS").unwrap_or(defaults.max_ports),
        guest_port: env_parse("WS_GUEST_PORT").unwrap_or(defaults.guest_port),
        health: HealthConfig {
            path: std::env::var("WS_HEALTH_PATH").unwrap_or(defaults.health.path),
            ..defaults.health
        },
    }
}

fn default_proxy() -> ProxyConfig {
    let defaults = ProxyConfig::default();
    ProxyConfig {
        admin_url: std::env::var("WS_PROXY_ADMIN_URL").ok(),
        server: std::env::var("WS_PROXY_SERVER").unwrap_or(defaults.server),
        ..defaults
    }
}

fn default_runtime() -> RuntimeConfig {
    let defaults = RuntimeConfig::default();
    RuntimeConfig {
        backend: std::env::var("WS_RUNTIME").unwrap_or(defaults.backend),
        guest_port: env_parse("WS_GUEST_PORT").unwrap_or(defaults.guest_port),
        ..defaults
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            slots_path: default_slots_path(),
            queue: default_queue(),
            orchestrator: default_orchestrator(),
            proxy: default_proxy(),
            runtime: default_runtime(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn load_from_path(path: &Path) -> ws_core::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml_ng::from_str(&contents)?;
        Ok(config)
    }

    /// `path`, else `WS_CONFIG`, else the environment alone.
    pub fn load(path: Option<&Path>) -> ws_core::Result<Self> {
        let from_env = std::env::var_os("WS_CONFIG").map(PathBuf::from);
        match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::from_env()),
        }
    }

    /// Database the queue lives in.
    pub fn queue_db_path(&self) -> &Path {
        self.queue.path.as_deref().unwrap_or(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "WS_DB_PATH",
        "WS_RUNTIME",
        "WS_QUEUE_BACKEND",
        "WS_MAX_WORKSPACES",
        "WS_PROXY_ADMIN_URL",
        "WS_CONFIG",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_environment() {
        clear_env();
        let config = Config::from_env();
        assert!(config.db_path.ends_with(".ws/ws.db"));
        assert_eq!(config.queue.backend, QueueBackend::Sqlite);
        assert_eq!(config.runtime.backend, "docker");
        assert!(config.proxy.admin_url.is_none());
        assert_eq!(config.worker.error_backoff_ms, 5000);
        assert_eq!(config.queue_db_path(), config.db_path.as_path());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_defaults() {
        clear_env();
        std::env::set_var("WS_DB_PATH", "/srv/ws/state.db");
        std::env::set_var("WS_RUNTIME", "firecracker");
        std::env::set_var("WS_QUEUE_BACKEND", "memory");
        std::env::set_var("WS_MAX_WORKSPACES", "7");
        std::env::set_var("WS_PROXY_ADMIN_URL", "http://127.0.0.1:2019");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.db_path, PathBuf::from("/srv/ws/state.db"));
        assert_eq!(config.runtime.backend, "firecracker");
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.orchestrator.max_workspaces, 7);
        assert_eq!(
            config.proxy.admin_url.as_deref(),
            Some("http://127.0.0.1:2019")
        );
    }

    #[test]
    #[serial]
    fn test_yaml_file_sections() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        std::fs::write(
            &path,
            r#"
db_path: /var/lib/ws/ws.db
queue:
  backend: sqlite
  path: /var/lib/ws/queue.db
  visibility_timeout_secs: 60
runtime:
  backend: stub
proxy:
  admin_url: http://localhost:2019
  auth:
    mode: basic
    username: dev
    password_hash: hash
worker:
  idle_delay_ms: 50
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/ws/ws.db"));
        assert_eq!(config.queue_db_path(), Path::new("/var/lib/ws/queue.db"));
        assert_eq!(config.queue.sqlite.visibility_timeout_secs, 60);
        assert_eq!(config.queue.sqlite.wait_time_secs, 20);
        assert_eq!(config.runtime.backend, "stub");
        assert_eq!(config.runtime.guest_port, 8080);
        assert_eq!(config.proxy.server, "srv0");
        assert!(matches!(
            config.proxy.auth,
            ws_proxy::ProxyAuth::Basic { .. }
        ));
        assert_eq!(config.worker.idle_delay_ms, 50);
        assert_eq!(config.worker.error_backoff_ms, 5000);
    }

    #[test]
    #[serial]
    fn test_config_env_var_names_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        std::fs::write(&path, "runtime:\n  backend: tart\n").unwrap();

        std::env::set_var("WS_CONFIG", &path);
        let config = Config::load(None);
        clear_env();

        assert_eq!(config.unwrap().runtime.backend, "tart");
    }

    #[test]
    fn test_queue_backend_parse() {
        assert_eq!("SQLite".parse::<QueueBackend>(), Ok(QueueBackend::Sqlite));
        assert!("sqs".parse::<QueueBackend>().is_err());
    }
}
