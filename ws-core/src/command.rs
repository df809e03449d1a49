//! External command execution.
//!
//! Every backend drives its virtualization tool through this module. Commands
//! run on tokio's blocking pool (the underlying `duct` handles are
//! synchronous) and are bounded by an optional timeout, so a stuck CLI call
//! surfaces as [`Error::Timeout`] instead of hanging a provisioning job.

// Standard library
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

// External crates
use tracing::{debug, warn};
use which::which;

// Internal imports
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ERROR_CONTEXT_LINES: usize = 50;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout decoded lossily, trailing whitespace trimmed.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim_end().to_string()
    }
}

/// Builder for an external command with consistent error handling.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl ExternalCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed these bytes to the command's stdin.
    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable command line, used in logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run to completion and return the output regardless of exit status.
    pub async fn output(self) -> Result<CommandOutput> {
        tokio::task::spawn_blocking(move || self.output_blocking()).await?
    }

    /// Run to completion; a non-zero exit becomes [`Error::Command`].
    pub async fn run(self) -> Result<CommandOutput> {
        let full_command = self.display();
        let output = self.output().await?;
        if output.success() {
            return Ok(output);
        }

        let combined = format!("{}\n{}", String::from_utf8_lossy(&output.stdout), output.stderr);
        let context: Vec<&str> = combined
            .lines()
            .filter(|l| !l.trim().is_empty())
            .rev()
            .take(ERROR_CONTEXT_LINES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        Err(Error::Command(format!(
            "exit code {:?}: {}\n{}",
            output.code,
            full_command,
            context.join("\n")
        )))
    }

    /// Run to completion and return trimmed stdout.
    pub async fn read(self) -> Result<String> {
        Ok(self.run().await?.stdout_str())
    }

    /// Spawn the command detached from the orchestrator's process group,
    /// appending stdout/stderr to `log_path`.
    ///
    /// Returns the PID of the spawned child. Callers that need the PID of a
    /// daemonising program must not rely on it and should discover the real
    /// process instead.
    pub fn spawn_detached(self, log_path: &Path) -> Result<u32> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        debug!(command = %self.display(), log = %log_path.display(), "spawning detached process");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|e| {
                Error::Command(format!("failed to spawn '{}': {}", self.display(), e))
            })?;

        let pid = child.id();

        // Reap the child when it exits so it never lingers as a zombie.
        thread::spawn(move || {
            if let Err(e) = child.wait() {
                warn!(pid, error = %e, "failed to reap detached process");
            }
        });

        Ok(pid)
    }

    fn output_blocking(self) -> Result<CommandOutput> {
        let full_command = self.display();
        debug!(command = %full_command, "executing command");

        let mut expression = duct::cmd(self.program.as_str(), &self.args)
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        expression = match self.stdin {
            Some(input) => expression.stdin_bytes(input),
            None => expression.stdin_null(),
        };

        let handle = expression.start().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Dependency(self.program.clone())
            } else {
                Error::Command(format!("failed to start '{}': {}", full_command, e))
            }
        })?;

        let started = Instant::now();
        loop {
            if let Some(output) = handle.try_wait()? {
                return Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: output.stdout.clone(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    let _ = handle.kill();
                    return Err(Error::Timeout(format!(
                        "command exceeded {}s: {}",
                        timeout.as_secs(),
                        full_command
                    )));
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}
