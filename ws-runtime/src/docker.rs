//! Docker backend.
//!
//! Each workspace is one container whose guest service port is published on
//! an ephemeral loopback port. Guest operations run through `docker exec`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use ws_core::{BestEffort, CommandOutput, Error, ExternalCommand, Result};

use crate::config::{DockerConfig, PollSettings, RuntimeConfig};
use crate::guest;
use crate::poll::poll_until;
use crate::{CloneRepository, Configure, GuestFiles, RepositorySpec, Runtime, RuntimeStatus};

const MANAGED_LABEL: &str = "ws.managed=true";
const NETWORK_IPS_TEMPLATE: &str = "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}";

pub struct DockerRuntime {
    config: DockerConfig,
    guest_port: u16,
    poll: PollSettings,
}

/// Turn `docker port` output into a loopback dial address.
///
/// Output is one `host:port` mapping per line, IPv4 first
/// (`0.0.0.0:49153`, `[::]:49153`); the first parsable port wins.
pub fn parse_port_mapping(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, port) = line.trim().rsplit_once(':')?;
        let port: u16 = port.trim().parse().ok()?;
        Some(format!("127.0.0.1:{}", port))
    })
}

/// First address in the space-separated `inspect` network listing.
pub fn parse_container_ip(output: &str) -> Option<&str> {
    output.split_whitespace().next()
}

fn is_missing(output: &CommandOutput) -> bool {
    output.stderr.contains("No such object") || output.stderr.contains("No such container")
}

impl DockerRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            config: config.docker.clone(),
            guest_port: config.guest_port,
            poll: config.poll,
        }
    }

    fn docker(&self) -> ExternalCommand {
        ExternalCommand::new(self.config.binary.clone())
            .timeout(Duration::from_secs(self.config.command_timeout_secs))
    }

    /// `docker create` arguments for `name`.
    pub fn create_args(&self, name: &str, image: &str) -> Vec<String> {
        vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            MANAGED_LABEL.to_string(),
            "-p".to_string(),
            format!("127.0.0.1::{}", self.guest_port),
            image.to_string(),
        ]
    }

    fn exec(&self, name: &str, script: &str) -> ExternalCommand {
        let mut command = self.docker().args(["exec", "-i"]);
        if let Some(user) = &self.config.exec_user {
            command = command.args(["-u", user.as_str()]);
        }
        command.args([name, "sh", "-c", script])
    }

    async fn wait_running(&self, name: &str) -> Result<()> {
        poll_until(self.poll, &format!("container '{}' running", name), || async move {
            Ok(self.status(name).await? == RuntimeStatus::Running)
        })
        .await
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, name: &str, image: &str) -> Result<()> {
        info!(name, image, "creating container");
        self.docker().args(self.create_args(name, image)).run().await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker().args(["start", name]).run().await?;
        self.wait_running(name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.docker().args(["stop", name]).run().await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let output = self.docker().args(["rm", "-f", name]).output().await?;
        if output.success() || is_missing(&output) {
            return Ok(());
        }
        Err(Error::Command(format!(
            "docker rm -f {} failed: {}",
            name,
            output.stderr.trim()
        )))
    }

    async fn status(&self, name: &str) -> Result<RuntimeStatus> {
        let output = self
            .docker()
            .args(["inspect", "-f", "{{.State.Running}}", name])
            .output()
            .await?;

        if !output.success() {
            if is_missing(&output) {
                return Ok(RuntimeStatus::NotFound);
            }
            return Err(Error::Command(format!(
                "docker inspect {} failed: {}",
                name,
                output.stderr.trim()
            )));
        }

        let status = if output.stdout_str().trim() == "true" {
            RuntimeStatus::Running
        } else {
            RuntimeStatus::Stopped
        };
        debug!(name, %status, "container status");
        Ok(status)
    }

    async fn get_ip(&self, name: &str) -> Result<String> {
        let port_spec = format!("{}/tcp", self.guest_port);
        let output = self
            .docker()
            .args(["port", name, port_spec.as_str()])
            .read()
            .await?;
        parse_port_mapping(&output).ok_or_else(|| {
            Error::Runtime(format!(
                "container '{}' does not publish port {}: {:?}",
                name, self.guest_port, output
            ))
        })
    }

    /// Only the service port is published on loopback; any other guest port
    /// is dialled on the container's own network address.
    async fn port_addr(&self, name: &str, port: u16) -> Result<String> {
        let output = self
            .docker()
            .args(["inspect", "-f", NETWORK_IPS_TEMPLATE, name])
            .read()
            .await?;
        let ip = parse_container_ip(&output).ok_or_else(|| {
            Error::Runtime(format!("container '{}' has no network address", name))
        })?;
        Ok(format!("{}:{}", ip, port))
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
impl Configure for DockerRuntime {
    async fn configure(&self, name: &str, env: &BTreeMap<String, String>) -> Result<()> {
        self.exec(name, &guest::write_file_script(&self.config.config_path)?)
            .stdin_bytes(guest::config_blob(env))
            .run()
            .await?;
        self.docker().args(["restart", name]).run().await?;
        self.wait_running(name).await?;
        info!(name, "container configured");
        Ok(())
    }
}

#[async_trait]
impl CloneRepository for DockerRuntime {
    async fn clone_repository(
        &self,
        name: &str,
        _target_addr: &str,
        repo: &RepositorySpec,
        token: Option<&str>,
    ) -> Result<()> {
        let script = guest::clone_script(repo)?;
        if let Some(token) = token {
            self.exec(name, &guest::install_credential_helper_script())
                .stdin_bytes(guest::credential_helper(token))
                .run()
                .await?;
        }

        let cloned = self.exec(name, &script).run().await;
        if token.is_some() {
            self.exec(name, &guest::remove_credential_helper_script())
                .run()
                .await
                .best_effort("remove git credential helper");
        }
        cloned?;
        info!(name, url = %repo.url, "repository cloned");
        Ok(())
    }
}

#[async_trait]
impl GuestFiles for DockerRuntime {
    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let output = self.exec(name, &guest::read_file_script(path)?).output().await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if output.stderr.contains("No such file") {
            return Err(Error::NotFound(format!("guest file '{}'", path)));
        }
        Err(Error::Command(format!(
            "reading '{}' in {} failed: {}",
            path,
            name,
            output.stderr.trim()
        )))
    }

    async fn write_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.exec(name, &guest::write_file_script(path)?)
            .stdin_bytes(contents.to_vec())
            .run()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_mapping() {
        assert_eq!(
            parse_port_mapping("127.0.0.1:49153\n").as_deref(),
            Some("127.0.0.1:49153")
        );
        assert_eq!(
            parse_port_mapping("0.0.0.0:32768\n[::]:32768\n").as_deref(),
            Some("127.0.0.1:32768")
        );
        assert_eq!(parse_port_mapping(""), None);
        assert_eq!(parse_port_mapping("garbage"), None);
    }

    #[test]
    fn test_create_publishes_guest_port_on_loopback() {
        let runtime = DockerRuntime::new(&RuntimeConfig::default());
        let args = runtime.create_args("demo", "codercom/code-server:latest");
        assert_eq!(args[0], "create");
        assert!(args.windows(2).any(|w| w == ["--name", "demo"]));
        assert!(args.windows(2).any(|w| w == ["-p", "127.0.0.1::8080"]));
        assert_eq!(args.last().map(String::as_str), Some("codercom/code-server:latest"));
    }

    /// Runtime driving a shell script in place of the docker CLI.
    fn fake_docker(dir: &std::path::Path, body: &str) -> DockerRuntime {
        use std::os::unix::fs::PermissionsExt;
        let fake = dir.join("docker");
        std::fs::write(&fake, format!("#!/bin/sh\nD='{}'\n{}", dir.display(), body)).unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = RuntimeConfig::default();
        config.docker.binary = fake.to_string_lossy().to_string();
        config.poll = PollSettings {
            interval_ms: 1,
            max_attempts: 10,
        };
        DockerRuntime::new(&config)
    }

    fn calls(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_container_ip() {
        assert_eq!(parse_container_ip("172.17.0.3 \n"), Some("172.17.0.3"));
        assert_eq!(parse_container_ip(" 10.0.5.2 172.18.0.2 "), Some("10.0.5.2"));
        assert_eq!(parse_container_ip(" \n"), None);
    }

    #[tokio::test]
    async fn test_status_against_fake_cli() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(
            dir.path(),
            "case \"$4\" in\n  up) echo true ;;\n  down) echo false ;;\n  *) echo \"Error: No such object: $4\" >&2; exit 1 ;;\nesac\n",
        );

        assert_eq!(runtime.status("up").await.unwrap(), RuntimeStatus::Running);
        assert_eq!(runtime.status("down").await.unwrap(), RuntimeStatus::Stopped);
        assert_eq!(runtime.status("gone").await.unwrap(), RuntimeStatus::NotFound);
    }

    #[tokio::test]
    async fn test_port_addr_dials_container_network_not_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(
            dir.path(),
            "case \"$1\" in\n  port) echo 127.0.0.1:49153 ;;\n  inspect) echo '172.17.0.3 ' ;;\nesac\n",
        );

        assert_eq!(runtime.get_ip("demo").await.unwrap(), "127.0.0.1:49153");
        assert_eq!(runtime.port_addr("demo", 3000).await.unwrap(), "172.17.0.3:3000");
    }

    #[tokio::test]
    async fn test_port_addr_without_network_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(dir.path(), "echo ' '\n");
        let err = runtime.port_addr("demo", 3000).await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test]
    async fn test_configure_writes_restarts_and_waits_for_running() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(
            dir.path(),
            r#"echo "$1" >> "$D/calls"
case "$1" in
  exec) cat > "$D/config" ;;
  restart) touch "$D/restarted" ;;
  inspect)
    n=$(cat "$D/polls" 2>/dev/null || echo 0)
    n=$((n + 1))
    echo "$n" > "$D/polls"
    if [ -f "$D/restarted" ] && [ "$n" -ge 2 ]; then echo true; else echo false; fi
    ;;
esac
"#,
        );

        let mut env = BTreeMap::new();
        env.insert("auth".to_string(), "none".to_string());
        runtime.configure("demo", &env).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("config")).unwrap(),
            "auth: none\n"
        );
        assert_eq!(calls(dir.path()), vec!["exec", "restart", "inspect", "inspect"]);
    }

    #[tokio::test]
    async fn test_configure_times_out_when_container_stays_down() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(
            dir.path(),
            "case \"$1\" in\n  exec) cat > /dev/null ;;\n  inspect) echo false ;;\nesac\n",
        );

        let err = runtime.configure("demo", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_failed_token_clone_still_removes_credential_helper() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(
            dir.path(),
            r#"for script in "$@"; do :; done
echo "$script" >> "$D/calls"
case "$script" in
  cat*) cat > /dev/null ;;
  *"git clone"*) echo "fatal: repository not found" >&2; exit 128 ;;
esac
"#,
        );
        let repo = RepositorySpec {
            url: "https://github.com/acme/private.git".into(),
            branch: None,
            directory: None,
        };

        let err = runtime
            .clone_repository("demo", "127.0.0.1:49153", &repo, Some("ghp_abc"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("repository not found"));

        let calls = calls(dir.path());
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains("credential.helper"));
        assert!(calls[1].contains("git clone"));
        assert_eq!(calls[2], guest::remove_credential_helper_script());
    }

    #[tokio::test]
    async fn test_anonymous_clone_installs_no_helper() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(
            dir.path(),
            "for script in \"$@\"; do :; done\necho \"$script\" >> \"$D/calls\"\n",
        );
        let repo = RepositorySpec {
            url: "https://github.com/acme/app.git".into(),
            branch: None,
            directory: None,
        };

        runtime
            .clone_repository("demo", "127.0.0.1:49153", &repo, None)
            .await
            .unwrap();
        let calls = calls(dir.path());
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("git clone"));
    }
}
