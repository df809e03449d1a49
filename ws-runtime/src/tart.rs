//! Tart backend for macOS and Linux VMs on Apple silicon.
//!
//! Lifecycle goes through the `tart` CLI. `tart run` blocks for the life of
//! the VM, so `start` launches it detached and waits for `tart list` to
//! report the VM as running. Guest access goes over SSH to `tart ip`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use ws_core::{Error, ExternalCommand, Result};

use crate::config::{PollSettings, RuntimeConfig, TartConfig};
use crate::poll::{poll_for, poll_until};
use crate::ssh::{host_of, SshHelper};
use crate::{CloneRepository, Configure, GuestFiles, RepositorySpec, Runtime, RuntimeStatus};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

pub struct TartRuntime {
    config: TartConfig,
    guest_port: u16,
    poll: PollSettings,
    ssh: SshHelper,
}

/// Find `name`'s state in `tart list` output.
///
/// The listing is whitespace-aligned with a header row; the `Name` and
/// `State` columns are located by header so column order does not matter.
pub fn parse_tart_list(output: &str, name: &str) -> Option<String> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<String> = lines
        .next()?
        .split_whitespace()
        .map(|h| h.to_ascii_lowercase())
        .collect();
    let name_col = header.iter().position(|h| h == "name")?;
    let state_col = header.iter().position(|h| h == "state")?;

    lines.find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.get(name_col) == Some(&name) {
            fields.get(state_col).map(|s| s.to_ascii_lowercase())
        } else {
            None
        }
    })
}

impl TartRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            config: config.tart.clone(),
            guest_port: config.guest_port,
            poll: config.poll,
            ssh: SshHelper::new(config.ssh.clone(), config.poll),
        }
    }

    fn tart(&self) -> ExternalCommand {
        ExternalCommand::new(self.config.binary.clone()).timeout(COMMAND_TIMEOUT)
    }

    async fn guest_host(&self, name: &str) -> Result<String> {
        let ip = self.tart().args(["ip", name]).read().await?;
        if ip.is_empty() {
            return Err(Error::Runtime(format!("tart reported no IP for '{}'", name)));
        }
        Ok(ip)
    }
}

#[async_trait]
impl Runtime for TartRuntime {
    fn name(&self) -> &'static str {
        "tart"
    }

    async fn create(&self, name: &str, image: &str) -> Result<()> {
        info!(name, image, "cloning tart vm");
        self.tart().args(["clone", image, name]).run().await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        if self.status(name).await? == RuntimeStatus::Running {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.log_dir).await?;
        let log_path = self.config.log_dir.join(format!("{}.log", name));
        ExternalCommand::new(self.config.binary.clone())
            .args(["run", "--no-graphics", name])
            .spawn_detached(&log_path)?;

        poll_until(self.poll, &format!("tart vm '{}' running", name), || async move {
            Ok(self.status(name).await? == RuntimeStatus::Running)
        })
        .await?;
        info!(name, "tart vm running");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.tart().args(["stop", name]).run().await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.tart().args(["delete", name]).run().await?;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<RuntimeStatus> {
        let listing = self.tart().arg("list").read().await?;
        let status = match parse_tart_list(&listing, name).as_deref() {
            Some("running") => RuntimeStatus::Running,
            Some(_) => RuntimeStatus::Stopped,
            None => RuntimeStatus::NotFound,
        };
        debug!(name, %status, "tart status");
        Ok(status)
    }

    async fn get_ip(&self, name: &str) -> Result<String> {
        let ip = poll_for(self.poll, &format!("IP for tart vm '{}'", name), || async move {
            Ok(Some(self.guest_host(name).await?))
        })
        .await?;
        Ok(format!("{}:{}", ip, self.guest_port))
    }

    fn configurer(&self) -> Option<&dyn Configure> {
        Some(self)
    }

    fn cloner(&self) -> Option<&dyn CloneRepository> {
        Some(self)
    }

    fn files(&self) -> Option<&dyn GuestFiles> {
        Some(self)
    }
}

#[async_trait]
impl Configure for TartRuntime {
    async fn configure(&self, name: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let host = self.guest_host(name).await?;
        self.ssh.configure(&host, env).await
    }
}

#[async_trait]
impl CloneRepository for TartRuntime {
    async fn clone_repository(
        &self,
        _name: &str,
        target_addr: &str,
        repo: &RepositorySpec,
        token: Option<&str>,
    ) -> Result<()> {
        self.ssh
            .clone_repository(host_of(target_addr), repo, token)
            .await
    }
}

#[async_trait]
impl GuestFiles for TartRuntime {
    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let host = self.guest_host(name).await?;
        self.ssh.read_file(&host, path).await
    }

    async fn write_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()> {
        let host = self.guest_host(name).await?;
        self.ssh.write_file(&host, path, contents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Source Name                 Disk Size SizeOnDisk State
local  ws-demo              50   21   21         running
local  ws-other             50   21   4          stopped
OCI    ghcr.io/cirruslabs/macos-sequoia-base:latest 50 25 25 stopped
";

    #[test]
    fn test_parse_tart_list_by_header() {
        assert_eq!(parse_tart_list(LISTING, "ws-demo").as_deref(), Some("running"));
        assert_eq!(parse_tart_list(LISTING, "ws-other").as_deref(), Some("stopped"));
        assert_eq!(parse_tart_list(LISTING, "ws-missing"), None);
    }

    #[test]
    fn test_parse_tart_list_reordered_columns() {
        let listing = "STATE NAME\nsuspended alpha\n";
        assert_eq!(parse_tart_list(listing, "alpha").as_deref(), Some("suspended"));
    }

    #[test]
    fn test_parse_tart_list_empty_output() {
        assert_eq!(parse_tart_list("", "alpha"), None);
        assert_eq!(parse_tart_list("Source Name State\n", "alpha"), None);
    }

    #[test]
    fn test_all_guest_capabilities_exposed() {
        let runtime = TartRuntime::new(&RuntimeConfig::default());
        assert!(runtime.configurer().is_some());
        assert!(runtime.cloner().is_some());
        assert!(runtime.files().is_some());
    }

    /// Runtime driving a shell script in place of the tart CLI. `run_body`
    /// is what the fake does when launched with `run`.
    fn fake_tart(dir: &std::path::Path, run_body: &str) -> TartRuntime {
        use std::os::unix::fs::PermissionsExt;
        let fake = dir.join("tart");
        std::fs::write(
            &fake,
            format!(
                r#"#!/bin/sh
D='{dir}'
case "$1" in
  list) printf 'Source Name State\nlocal demo %s\n' "$(cat "$D/state" 2>/dev/null || echo stopped)" ;;
  run) echo "$@" > "$D/run-args"; {run_body} ;;
esac
"#,
                dir = dir.display(),
                run_body = run_body
            ),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = RuntimeConfig::default();
        config.tart.binary = fake.to_string_lossy().to_string();
        config.tart.log_dir = dir.join("logs");
        config.poll = PollSettings {
            interval_ms: 20,
            max_attempts: 100,
        };
        TartRuntime::new(&config)
    }

    #[tokio::test]
    async fn test_start_detaches_run_and_polls_listing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_tart(
            dir.path(),
            r#"sleep 0.2; echo running > "$D/state"; exec sleep 2"#,
        );
        assert_eq!(runtime.status("demo").await.unwrap(), RuntimeStatus::Stopped);

        let started = std::time::Instant::now();
        runtime.start("demo").await.unwrap();
        // `run` keeps going; start returned once the listing said running.
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(runtime.status("demo").await.unwrap(), RuntimeStatus::Running);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("run-args")).unwrap().trim(),
            "run --no-graphics demo"
        );
        assert!(dir.path().join("logs/demo.log").exists());
    }

    #[tokio::test]
    async fn test_start_gives_up_when_vm_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = fake_tart(dir.path(), "exit 1");
        runtime.poll = PollSettings {
            interval_ms: 5,
            max_attempts: 3,
        };

        let err = runtime.start("demo").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_start_skips_run_when_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_tart(dir.path(), "true");
        std::fs::write(dir.path().join("state"), "running\n").unwrap();

        runtime.start("demo").await.unwrap();
        assert!(!dir.path().join("run-args").exists());
    }
}

