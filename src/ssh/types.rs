//! Command runner abstraction and command output types.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::error::SshError;

/// Boxed future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = Result<RawOutput, SshError>> + Send + 'a>>;

/// Undecoded result of running a local client binary.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl RawOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Lossy stderr text, used for diagnostics only.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Decoded result of a successful remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Remote exit status.
    pub returncode: i32,
    /// Remote standard output.
    pub stdout: String,
    /// Remote standard error.
    pub stderr: String,
}

/// Abstraction over local process execution so tests can script `ssh` and
/// `scp` without a network.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] if the command cannot be started.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a>;

    /// Starts `program` without waiting for it. Used from `Drop`, where no
    /// runtime may be available to await a child.
    fn run_detached(&self, program: &str, args: &[OsString]);
}

/// Real command runner that spawns host processes through `tokio::process`.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| SshError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(RawOutput {
                code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        })
    }

    fn run_detached(&self, program: &str, args: &[OsString]) {
        let spawned = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(err) = spawned {
            debug!(program, error = %err, "detached command failed to start");
        }
    }
}
