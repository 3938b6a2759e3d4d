//! Command runner abstraction for the external CLIs this server drives.
//!
//! `osascript` and `zellij` are invoked through [`CommandRunner`] so their
//! wrappers can be exercised without either tool installed.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use ttymux_common::{Result, TtymuxError};

/// Output from a command execution.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if the process was killed by a signal)
    pub exit_code: Option<i32>,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
}

impl CommandOutput {
    /// Stdout on success, stderr otherwise.
    pub fn message(&self) -> &str {
        if self.success {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Trait for running external commands. Mockable for testing.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, giving up after `timeout`.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`]; `Err` is
    /// reserved for commands that could not be started or did not finish.
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Real command runner that spawns system processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        debug!(program = %program, args = ?args, timeout_ms = timeout.as_millis() as u64, "Running command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(program = %program, error = %e, "Command failed to execute");
                return Err(TtymuxError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to execute {program}: {e}"),
                )));
            }
            Err(_) => {
                warn!(program = %program, "Command timed out");
                return Err(TtymuxError::Timeout {
                    program: program.to_string(),
                    seconds: timeout.as_secs_f64(),
                });
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            success: output.status.success(),
        })
    }
}
