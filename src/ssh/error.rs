//! Error taxonomy for the SSH transport.

use std::fmt;

use thiserror::Error;

/// Reason a remote command was reported as failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionFailure {
    /// The `ssh` client exited with 255, meaning the connection dropped or
    /// could not be used.
    ConnectionLost,
    /// The remote process exited with a non-zero status.
    ExitStatus(i32),
    /// The client was terminated by a signal before reporting a status.
    Terminated,
    /// Output could not be decoded as UTF-8 text.
    InvalidUtf8,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ExitStatus(code) => write!(f, "exit status {code}"),
            Self::Terminated => f.write_str("terminated by signal"),
            Self::InvalidUtf8 => f.write_str("output is not valid UTF-8"),
        }
    }
}

/// Direction of an `scp` transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    /// Local file copied to the remote host.
    Upload,
    /// Remote file copied to the local host.
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Errors surfaced by [`super::SshSessionService`] and [`super::SshSession`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when configuration is missing required values.
    #[error(
        "missing {field}: set SLURMFLOW_SSH_{env_suffix} or add {field} to [ssh] in slurmflow.toml",
        env_suffix = field.to_uppercase()
    )]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when the control connection cannot be established.
    #[error("failed to connect to {host}: {message}")]
    Connection {
        /// Host the session targeted.
        host: String,
        /// Diagnostic returned by the client.
        message: String,
    },
    /// Raised when a local client binary cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a remote command fails or its output is unusable.
    #[error("remote command `{command}` failed ({reason}): {stderr}")]
    Execution {
        /// Command as sent to the remote shell.
        command: String,
        /// Classified failure.
        reason: ExecutionFailure,
        /// Truncated prefix of stderr.
        stderr: String,
    },
    /// Raised when `scp` fails.
    #[error("{direction} {local} <-> {remote} failed: {message}")]
    Transfer {
        /// Whether the file was travelling to or from the remote host.
        direction: TransferDirection,
        /// Local path.
        local: String,
        /// Remote path.
        remote: String,
        /// Truncated stderr from `scp`.
        message: String,
    },
}
