//! SSH transport for the cluster login node.
//!
//! [`SshSessionService`] hands out [`SshSession`]s, each backed by its own
//! OpenSSH control master so that every command and transfer in a session
//! reuses one authenticated connection. Sessions are verified with an
//! `echo ping` round-trip before being returned and are torn down by
//! [`SshSession::close`] or, failing that, on drop.

use std::ffi::OsString;
use std::sync::Arc;

use camino::Utf8Path;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod config;
mod error;
mod types;
mod util;

pub use config::{DEFAULT_CONTROL_DIR, SshConfig};
pub use error::{ExecutionFailure, SshError, TransferDirection};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, RawOutput, RunnerFuture};
pub use util::{DIAGNOSTIC_PREFIX_CHARS, expand_tilde, truncate_for_diagnostics};

/// Exit status the OpenSSH client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Hands out verified SSH sessions and bounds concurrent remote commands.
#[derive(Debug)]
pub struct SshSessionService<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: Arc<R>,
    channels: Arc<Semaphore>,
}

impl<R: CommandRunner> Clone for SshSessionService<R> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            channels: Arc::clone(&self.channels),
        }
    }
}

impl SshSessionService<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SshError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshSessionService<R> {
    /// Creates a service using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SshError> {
        config.validate()?;
        let channels = Arc::new(Semaphore::new(config.max_channels));
        Ok(Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
            channels,
        })
    }

    /// Returns the validated configuration.
    #[must_use]
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Opens a session and verifies it with `echo ping`.
    ///
    /// The returned session must be released with [`SshSession::close`];
    /// dropping it instead fires the same teardown without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Connection`] when the login node is unreachable or
    /// the verification round-trip does not echo back, or
    /// [`SshError::Spawn`] when the client binary is missing.
    pub async fn session(&self) -> Result<SshSession<R>, SshError> {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
        let control_path = format!(
            "{}/slurmflow-{suffix}",
            self.config.control_dir.trim_end_matches('/')
        );
        info!(host = %self.config.host, user = %self.config.user, "opening SSH session");

        let session = SshSession {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            channels: Arc::clone(&self.channels),
            control_path,
            open: true,
        };

        let args = session.ssh_args("echo ping");
        let raw = match self.runner.run(&self.config.ssh_bin, &args).await {
            Ok(raw) => raw,
            Err(err) => {
                session.close().await;
                return Err(err);
            }
        };
        let echoed = raw.is_success() && String::from_utf8_lossy(&raw.stdout).contains("ping");
        if !echoed {
            let message = if raw.stderr.is_empty() {
                String::from("ping verification did not echo back")
            } else {
                truncate_for_diagnostics(&raw.stderr_lossy())
            };
            warn!(host = %self.config.host, %message, "SSH session verification failed");
            session.close().await;
            return Err(SshError::Connection {
                host: self.config.host.clone(),
                message,
            });
        }

        info!(host = %self.config.host, "SSH session established");
        Ok(session)
    }
}

/// One verified connection to the login node.
#[derive(Debug)]
pub struct SshSession<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: Arc<R>,
    channels: Arc<Semaphore>,
    control_path: String,
    open: bool,
}

impl<R: CommandRunner> SshSession<R> {
    /// Control socket backing this session.
    #[must_use]
    pub fn control_path(&self) -> &str {
        &self.control_path
    }

    /// Executes `command` on the remote host.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Execution`] when the command exits non-zero, the
    /// connection drops, or the output is not UTF-8. The error carries a
    /// truncated stderr prefix.
    ///
    /// # Security
    ///
    /// `command` is handed to the remote shell verbatim; callers must quote
    /// untrusted input.
    pub async fn run_command(&self, command: &str) -> Result<CommandOutput, SshError> {
        let _permit = self.acquire_channel().await?;
        let args = self.ssh_args(command);
        info!(command, "running remote command");
        let raw = self.runner.run(&self.config.ssh_bin, &args).await?;
        let stderr_prefix = truncate_for_diagnostics(&raw.stderr_lossy());

        let (Ok(stdout), Ok(stderr)) = (String::from_utf8(raw.stdout), String::from_utf8(raw.stderr))
        else {
            return Err(SshError::Execution {
                command: command.to_owned(),
                reason: ExecutionFailure::InvalidUtf8,
                stderr: stderr_prefix,
            });
        };

        info!(
            command,
            returncode = ?raw.code,
            stdout = %truncate_for_diagnostics(&stdout),
            stderr = %stderr_prefix,
            "remote command finished"
        );

        let reason = match raw.code {
            Some(0) => {
                return Ok(CommandOutput {
                    returncode: 0,
                    stdout,
                    stderr,
                });
            }
            Some(SSH_CLIENT_FAILURE) => ExecutionFailure::ConnectionLost,
            Some(code) => ExecutionFailure::ExitStatus(code),
            None => ExecutionFailure::Terminated,
        };
        Err(SshError::Execution {
            command: command.to_owned(),
            reason,
            stderr: stderr_prefix,
        })
    }

    /// Copies `local` to `remote` over the session's control connection.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Transfer`] when `scp` fails. No retry is attempted.
    pub async fn scp_upload(&self, local: &Utf8Path, remote: &str) -> Result<(), SshError> {
        let target = format!("{}:{remote}", self.config.destination());
        self.scp(
            TransferDirection::Upload,
            local,
            remote,
            OsString::from(local.as_str()),
            OsString::from(target),
        )
        .await
    }

    /// Copies `remote` to `local` over the session's control connection.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Transfer`] when `scp` fails. No retry is attempted.
    pub async fn scp_download(&self, local: &Utf8Path, remote: &str) -> Result<(), SshError> {
        let source = format!("{}:{remote}", self.config.destination());
        self.scp(
            TransferDirection::Download,
            local,
            remote,
            OsString::from(source),
            OsString::from(local.as_str()),
        )
        .await
    }

    /// Shuts the control master down. Errors are logged and ignored.
    pub async fn close(mut self) {
        self.open = false;
        let args = self.exit_args();
        match self.runner.run(&self.config.ssh_bin, &args).await {
            Ok(raw) if raw.is_success() => {
                info!(host = %self.config.host, "SSH session closed");
            }
            Ok(raw) => debug!(
                host = %self.config.host,
                stderr = %truncate_for_diagnostics(&raw.stderr_lossy()),
                "control master exit reported failure"
            ),
            Err(err) => debug!(host = %self.config.host, error = %err, "control master exit failed"),
        }
    }

    async fn scp(
        &self,
        direction: TransferDirection,
        local: &Utf8Path,
        remote: &str,
        from: OsString,
        to: OsString,
    ) -> Result<(), SshError> {
        let _permit = self.acquire_channel().await?;
        let mut args = self.config.common_options(&self.control_path);
        args.push(OsString::from("-P"));
        args.push(OsString::from(self.config.port.to_string()));
        args.push(from);
        args.push(to);

        let transfer_error = |message: String| SshError::Transfer {
            direction,
            local: local.to_string(),
            remote: remote.to_owned(),
            message,
        };
        let raw = self
            .runner
            .run(&self.config.scp_bin, &args)
            .await
            .map_err(|err| transfer_error(truncate_for_diagnostics(&err.to_string())))?;
        if !raw.is_success() {
            return Err(transfer_error(truncate_for_diagnostics(&raw.stderr_lossy())));
        }
        info!(%direction, %local, remote, "transfer complete");
        Ok(())
    }

    async fn acquire_channel(&self) -> Result<SemaphorePermit<'_>, SshError> {
        self.channels
            .acquire()
            .await
            .map_err(|_| SshError::Connection {
                host: self.config.host.clone(),
                message: String::from("channel pool closed"),
            })
    }

    fn ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args = self.config.common_options(&self.control_path);
        args.push(OsString::from("-p"));
        args.push(OsString::from(self.config.port.to_string()));
        args.push(OsString::from(self.config.destination()));
        args.push(OsString::from(command));
        args
    }

    fn exit_args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", self.control_path)),
            OsString::from("-O"),
            OsString::from("exit"),
            OsString::from(self.config.destination()),
        ]
    }
}

impl<R: CommandRunner> Drop for SshSession<R> {
    fn drop(&mut self) {
        if self.open {
            debug!(host = %self.config.host, "releasing unclosed SSH session");
            self.runner
                .run_detached(&self.config.ssh_bin, &self.exit_args());
        }
    }
}
