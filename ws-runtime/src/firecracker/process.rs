//! Process-table helpers for detached Firecracker processes.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};
use ws_core::{Error, ExternalCommand, Result};

/// Search the process table for the process serving `socket`.
///
/// The API socket path is unique per VM, so matching the full
/// `--api-sock <path>` argument identifies exactly one process.
pub async fn find_pid(pgrep: &str, socket: &Path) -> Result<Option<u32>> {
    let pattern = format!("--api-sock {}", socket.display());
    let output = ExternalCommand::new(pgrep)
        .args(["-f", "--"])
        .arg(pattern)
        .output()
        .await?;

    match output.code {
        Some(0) => Ok(output
            .stdout_str()
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .min()),
        // pgrep exits 1 when nothing matched.
        Some(1) => Ok(None),
        code => Err(Error::Command(format!(
            "pgrep exited with {:?}: {}",
            code,
            output.stderr.trim()
        ))),
    }
}

pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn force_kill(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| Error::Internal(format!("pid {} out of range", pid)))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Runtime(format!("failed to kill pid {}: {}", pid, e))),
    }
}

/// Read a PID file. Missing or garbled files read as `None`.
pub async fn read_pid_file(path: &Path) -> Option<u32> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => match content.trim().parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                warn!(path = %path.display(), "ignoring unparsable pid file");
                None
            }
        },
        Err(_) => None,
    }
}

pub async fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    tokio::fs::write(path, format!("{}\n", pid)).await?;
    debug!(path = %path.display(), pid, "wrote pid file");
    Ok(())
}
