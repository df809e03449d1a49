//! Firecracker microVM backend.
//!
//! Each VM owns a working directory under `vms_dir`:
//!
//! ```text
//! <vms_dir>/<name>/
//!   rootfs.ext4        copy of the base image
//!   config.json        --config-file document
//!   firecracker.sock   API socket while running
//!   firecracker.pid    PID discovered after start
//!   firecracker.log    stdout/stderr of the VMM
//! ```
//!
//! Networking comes from the shared [`SlotAllocator`]: the slot decides the
//! TAP device, the /30 and the MAC. TAP devices need root, so they are
//! managed through a privileged helper invoked with `sudo -n`.

pub mod config;
pub mod control;
pub mod process;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use ws_core::{BestEffort, Error, ExternalCommand, Result};
use ws_network::{SlotAllocation, SlotAllocator};

use crate::config::{FirecrackerConfig, PollSettings, RuntimeConfig};
use crate::poll::poll_for;
use crate::ssh::{host_of, SshHelper};
use crate::{CloneRepository, Configure, GuestFiles, RepositorySpec, Runtime, RuntimeStatus};

use self::config::VmConfigFile;
use self::control::FirecrackerClient;

const TAP_HELPER_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Files belonging to one VM.
#[derive(Debug, Clone)]
pub struct VmPaths {
    pub dir: PathBuf,
    pub rootfs: PathBuf,
    pub config: PathBuf,
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub log: PathBuf,
}

impl VmPaths {
    pub fn new(vms_dir: &Path, name: &str) -> Self {
        let dir = vms_dir.join(name);
        Self {
            rootfs: dir.join("rootfs.ext4"),
            config: dir.join("config.json"),
            socket: dir.join("firecracker.sock"),
            pid: dir.join("firecracker.pid"),
            log: dir.join("firecracker.log"),
            dir,
        }
    }
}

pub struct FirecrackerRuntime {
    config: FirecrackerConfig,
    guest_port: u16,
    poll: PollSettings,
    ssh: SshHelper,
    slots: Arc<SlotAllocator>,
}

impl FirecrackerRuntime {
    pub fn new(config: &RuntimeConfig, slots: Arc<SlotAllocator>) -> Self {
        Self {
            config: config.firecracker.clone(),
            guest_port: config.guest_port,
            poll: config.poll,
            ssh: SshHelper::new(config.ssh.clone(), config.poll),
            slots,
        }
    }

    pub fn paths(&self, name: &str) -> VmPaths {
        VmPaths::new(&self.config.vms_dir, name)
    }

    fn base_image(&self, image: &str) -> PathBuf {
        self.config.images_dir.join(format!("{}.ext4", image))
    }

    /// `tap_helper` invocation, through `sudo -n` when configured.
    pub fn tap_command(&self, args: &[&str]) -> ExternalCommand {
        let helper = self.config.tap_helper.to_string_lossy().to_string();
        let command = if self.config.use_sudo {
            ExternalCommand::new("sudo").args(["-n", helper.as_str()])
        } else {
            ExternalCommand::new(helper)
        };
        command.args(args.iter().copied()).timeout(TAP_HELPER_TIMEOUT)
    }

    async fn create_tap(&self, slot: &SlotAllocation) -> Result<()> {
        self.tap_command(&[
            "create",
            &slot.tap_name,
            &slot.tap_ip,
            &slot.mask,
            &self.config.bridge,
        ])
        .run()
        .await?;
        debug!(tap = %slot.tap_name, bridge = %self.config.bridge, "tap device created");
        Ok(())
    }

    async fn destroy_tap(&self, tap_name: &str) -> Result<()> {
        self.tap_command(&["destroy", tap_name]).run().await?;
        Ok(())
    }

    async fn provision(&self, name: &str, image: &str, slot: &SlotAllocation) -> Result<()> {
        let paths = self.paths(name);
        let base = self.base_image(image);
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("base image {}", base.display())));
        }

        tokio::fs::create_dir_all(&paths.dir).await?;
        tokio::fs::copy(&base, &paths.rootfs).await?;
        self.create_tap(slot).await?;

        let document = VmConfigFile::new(
            &self.config.kernel_path,
            &paths.rootfs,
            slot,
            self.config.vcpu_count,
            self.config.mem_size_mib,
        );
        tokio::fs::write(&paths.config, serde_json::to_vec_pretty(&document)?).await?;
        Ok(())
    }

    async fn running_pid(&self, paths: &VmPaths) -> Option<u32> {
        process::read_pid_file(&paths.pid)
            .await
            .filter(|pid| process::is_alive(*pid))
    }

    async fn shutdown(&self, name: &str, paths: &VmPaths) -> Result<()> {
        let Some(pid) = self.running_pid(paths).await else {
            debug!(name, "no live firecracker process");
            return Ok(());
        };

        FirecrackerClient::new(&paths.socket)
            .send_ctrl_alt_del()
            .await
            .best_effort("send SendCtrlAltDel");

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.shutdown_timeout_secs);
        while process::is_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        if process::is_alive(pid) {
            warn!(name, pid, "graceful shutdown timed out, sending SIGKILL");
            process::force_kill(pid)?;
        }
        Ok(())
    }

    /// Slot table writes wait on a file lock, so they run off the async workers.
    async fn allocate_slot(&self, name: &str) -> Result<SlotAllocation> {
        let slots = Arc::clone(&self.slots);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || slots.allocate(&name)).await?
    }

    async fn release_slot(&self, name: &str) -> Result<()> {
        let slots = Arc::clone(&self.slots);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || slots.release(&name)).await?
    }

    async fn guest_host(&self, name: &str) -> Result<String> {
        let addr = self.get_ip(name).await?;
        Ok(host_of(&addr).to_string())
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Runtime for FirecrackerRuntime {
    fn name(&self) -> &'static str {
        "firecracker"
    }

    async fn create(&self, name: &str, image: &str) -> Result<()> {
        let slot = self.allocate_slot(name).await?;
        info!(name, image, slot = slot.slot, guest_ip = %slot.guest_ip, "creating microvm");

        if let Err(e) = self.provision(name, image, &slot).await {
            self.destroy_tap(&slot.tap_name)
                .await
                .best_effort("destroy tap after failed create");
            self.release_slot(name)
                .await
                .best_effort("release slot after failed create");
            tokio::fs::remove_dir_all(self.paths(name).dir)
                .await
                .best_effort("remove vm directory after failed create");
            return Err(e);
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let paths = self.paths(name);
        match self.status(name).await? {
            RuntimeStatus::Running => return Ok(()),
            RuntimeStatus::NotFound => {
                return Err(Error::NotFound(format!("microvm '{}'", name)));
            }
            RuntimeStatus::Stopped => {}
        }

        // A socket left behind by a crashed VMM makes firecracker refuse to start.
        remove_if_present(&paths.socket).await?;
        remove_if_present(&paths.pid).await?;

        ExternalCommand::new(self.config.binary.clone())
            .arg("--api-sock")
            .arg(paths.socket.as_os_str())
            .arg("--config-file")
            .arg(paths.config.as_os_str())
            .spawn_detached(&paths.log)?;

        let pgrep = self.config.pgrep_binary.as_str();
        let socket = paths.socket.as_path();
        let pid = poll_for(self.poll, &format!("firecracker process for '{}'", name), || async move {
            process::find_pid(pgrep, socket).await
        })
        .await?;

        process::write_pid_file(&paths.pid, pid).await?;
        info!(name, pid, "microvm started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let paths = self.paths(name);
        let result = self.shutdown(name, &paths).await;

        remove_if_present(&paths.socket)
            .await
            .best_effort("remove api socket");
        if result.is_ok() {
            remove_if_present(&paths.pid).await.best_effort("remove pid file");
            info!(name, "microvm stopped");
        }
        result
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let paths = self.paths(name);
        self.stop(name).await.best_effort("stop before remove");

        if let Some(slot) = self.slots.get(name) {
            self.destroy_tap(&slot.tap_name)
                .await
                .best_effort("destroy tap device");
        }
        self.release_slot(name).await?;

        match tokio::fs::remove_dir_all(&paths.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(name, "microvm removed");
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<RuntimeStatus> {
        let paths = self.paths(name);
        if !tokio::fs::try_exists(&paths.dir).await? {
            return Ok(RuntimeStatus::NotFound);
        }
        Ok(match self.running_pid(&paths).await {
            Some(_) => RuntimeStatus::Running,
            None => RuntimeStatus::Stopped,
        })
    }

    async fn get_ip(&self, name: &str) -> Result<String> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("network slot for '{}'", name)))?;
        Ok(format!("{}:{}", slot.guest_ip, self.guest_port))
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
impl Configure for FirecrackerRuntime {
    async fn configure(&self, name: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let host = self.guest_host(name).await?;
        self.ssh.configure(&host, env).await
    }
}

#[async_trait]
impl CloneRepository for FirecrackerRuntime {
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
impl GuestFiles for FirecrackerRuntime {
    async fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let host = self.guest_host(name).await?;
        self.ssh.read_file(&host, path).await
    }

    async fn write_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()> {
        let host = self.guest_host(name).await?;
        self.ssh.write_file(&host, path, contents).await
    }
}
