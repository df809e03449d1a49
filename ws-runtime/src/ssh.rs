//! SSH command helper shared by the VM backends.
//!
//! Guests are reached as `<user>@<ip>` with host key checking disabled, a
//! bounded connect timeout and batch mode, so a guest whose sshd is not up
//! yet fails fast instead of prompting.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};
use ws_core::{BestEffort, CommandOutput, Error, ExternalCommand, Result};

use crate::config::{PollSettings, SshConfig};
use crate::guest;
use crate::poll::poll_until;
use crate::RepositorySpec;

#[derive(Debug, Clone)]
pub struct SshHelper {
    config: SshConfig,
    poll: PollSettings,
}

/// Host part of a `host:port` dial address. Bare hosts pass through.
pub fn host_of(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

impl SshHelper {
    pub fn new(config: SshConfig, poll: PollSettings) -> Self {
        Self { config, poll }
    }

    /// Full ssh argument vector for running `remote` on `host`.
    pub fn ssh_args(&self, host: &str, remote: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ConnectTimeout=5".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-p".to_string(),
            self.config.port.to_string(),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        args.push(format!("{}@{}", self.config.user, host));
        args.push(remote.to_string());
        args
    }

    fn command(&self, host: &str, remote: &str) -> ExternalCommand {
        ExternalCommand::new(self.config.binary.clone())
            .args(self.ssh_args(host, remote))
            .timeout(Duration::from_secs(self.config.command_timeout_secs))
    }

    /// Run `remote` on `host`, failing on a non-zero exit.
    pub async fn exec(&self, host: &str, remote: &str) -> Result<CommandOutput> {
        self.command(host, remote).run().await
    }

    async fn exec_with_stdin(&self, host: &str, remote: &str, stdin: Vec<u8>) -> Result<CommandOutput> {
        self.command(host, remote).stdin_bytes(stdin).run().await
    }

    pub async fn wait_for_ssh(&self, host: &str) -> Result<()> {
        debug!(host, "waiting for ssh");
        poll_until(self.poll, &format!("ssh on {}", host), || async move {
            Ok(self.command(host, "true").output().await?.success())
        })
        .await
    }

    /// Write the service config and restart the service, retrying the whole
    /// round-trip while the guest is still booting.
    pub async fn configure(&self, host: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let script = format!(
            "{} && {}",
            guest::write_file_script(&self.config.config_path)?,
            self.config.restart_command
        );
        let blob = guest::config_blob(env).into_bytes();

        poll_until(self.poll, &format!("guest configuration on {}", host), || {
            let blob = blob.clone();
            let script = script.as_str();
            async move {
                self.exec_with_stdin(host, script, blob).await?;
                Ok(true)
            }
        })
        .await?;

        info!(host, path = %self.config.config_path, "guest configured");
        Ok(())
    }

    pub async fn clone_repository(
        &self,
        host: &str,
        repo: &RepositorySpec,
        token: Option<&str>,
    ) -> Result<()> {
        let script = guest::clone_script(repo)?;
        self.wait_for_ssh(host).await?;

        if let Some(token) = token {
            self.exec_with_stdin(
                host,
                &guest::install_credential_helper_script(),
                guest::credential_helper(token).into_bytes(),
            )
            .await?;
        }

        let cloned = self.exec(host, &script).await;
        if token.is_some() {
            self.exec(host, &guest::remove_credential_helper_script())
                .await
                .best_effort("remove git credential helper");
        }
        cloned?;
        info!(host, url = %repo.url, "repository cloned");
        Ok(())
    }

    pub async fn read_file(&self, host: &str, path: &str) -> Result<Vec<u8>> {
        let output = self.command(host, &guest::read_file_script(path)?).output().await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if output.stderr.contains("No such file") {
            return Err(Error::NotFound(format!("guest file '{}'", path)));
        }
        Err(Error::Command(format!(
            "reading '{}' on {} failed: {}",
            path,
            host,
            output.stderr.trim()
        )))
    }

    pub async fn write_file(&self, host: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.exec_with_stdin(host, &guest::write_file_script(path)?, contents.to_vec())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("172.16.0.2:8080"), "172.16.0.2");
        assert_eq!(host_of("192.168.64.5"), "192.168.64.5");
    }

    #[test]
    fn test_ssh_args_fixed_options() {
        let helper = SshHelper::new(
            SshConfig {
                user: "root".into(),
                identity_file: Some(PathBuf::from("/keys/id_ed25519")),
                ..Default::default()
            },
            PollSettings::default(),
        );
        let args = helper.ssh_args("172.16.0.2", "uptime");
        let joined = args.join(" ");
        assert!(joined.contains("StrictHostKeyChecking=no"));
        assert!(joined.contains("UserKnownHostsFile=/dev/null"));
        assert!(joined.contains("ConnectTimeout=5"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("-i /keys/id_ed25519"));
        assert_eq!(args[args.len() - 2], "root@172.16.0.2");
        assert_eq!(args[args.len() - 1], "uptime");
    }

    #[tokio::test]
    async fn test_wait_for_ssh_gives_up() {
        let helper = SshHelper::new(
            SshConfig {
                binary: "false".into(),
                ..Default::default()
            },
            PollSettings {
                interval_ms: 1,
                max_attempts: 2,
            },
        );
        let err = helper.wait_for_ssh("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_token_clone_removes_credential_helper_afterwards() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ssh");
        std::fs::write(
            &fake,
            format!(
                "#!/bin/sh\nfor remote in \"$@\"; do :; done\necho \"$remote\" >> '{}/calls'\ncase \"$remote\" in\n  cat*) cat > /dev/null ;;\n  *\"git clone\"*) exit 128 ;;\nesac\n",
                dir.path().display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let helper = SshHelper::new(
            SshConfig {
                binary: fake.to_string_lossy().to_string(),
                ..Default::default()
            },
            PollSettings {
                interval_ms: 1,
                max_attempts: 2,
            },
        );
        let repo = RepositorySpec {
            url: "https://github.com/acme/private.git".into(),
            branch: None,
            directory: None,
        };

        assert!(helper
            .clone_repository("172.16.0.2", &repo, Some("ghp_abc"))
            .await
            .is_err());

        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], "true");
        assert!(calls[1].contains("credential.helper"));
        assert!(calls[2].contains("git clone"));
        assert_eq!(calls[3], guest::remove_credential_helper_script());
    }
}
