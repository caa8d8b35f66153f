//! SSH connection settings loaded via `ortho-config`.
//!
//! [`SshConfig`] merges defaults, configuration files, and `SLURMFLOW_SSH_*`
//! environment variables. Authentication is fixed at construction: a key
//! file and a known-hosts file, with batch mode preventing password prompts.

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::ConfigError;

use super::error::SshError;
use super::util::expand_tilde;

/// Default directory holding per-session control sockets.
pub const DEFAULT_CONTROL_DIR: &str = "/tmp";

/// SSH settings for the cluster login node.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SLURMFLOW_SSH",
    discovery(
        app_name = "slurmflow",
        env_var = "SLURMFLOW_CONFIG_PATH",
        config_file_name = "slurmflow.toml",
        dotfile_name = ".slurmflow.toml",
        project_file_name = "slurmflow.toml"
    )
)]
pub struct SshConfig {
    /// Login node hostname or address.
    #[ortho_config(default = String::new())]
    pub host: String,
    /// Remote user to connect as.
    #[ortho_config(default = String::new())]
    pub user: String,
    /// SSH port.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Private key used for authentication. Supports `~/` expansion.
    pub identity_file: Option<String>,
    /// Known hosts file. When unset the client's defaults apply.
    pub known_hosts_file: Option<String>,
    /// Whether unknown host keys are rejected.
    #[ortho_config(default = true)]
    pub strict_host_key_checking: bool,
    /// Whether to force batch mode so the client never prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Directory for control master sockets.
    #[ortho_config(default = DEFAULT_CONTROL_DIR.to_owned())]
    pub control_dir: String,
    /// Seconds an idle control master lingers after the last client exits.
    #[ortho_config(default = 300)]
    pub control_persist_seconds: u32,
    /// Interval between keepalive messages on the control connection.
    #[ortho_config(default = 30)]
    pub keepalive_interval_seconds: u32,
    /// Maximum number of concurrent remote commands. `1` serialises all
    /// remote execution.
    #[ortho_config(default = 8)]
    pub max_channels: usize,
}

impl SshConfig {
    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SshError> {
        Self::require_value(&self.host, "host")?;
        Self::require_value(&self.user, "user")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.control_dir, "control_dir")?;
        Self::require_optional_value(self.identity_file.as_deref(), "identity_file")?;
        Self::require_optional_value(self.known_hosts_file.as_deref(), "known_hosts_file")?;
        if self.port == 0 {
            return Err(SshError::InvalidConfig {
                field: String::from("port"),
            });
        }
        if self.max_channels == 0 {
            return Err(SshError::InvalidConfig {
                field: String::from("max_channels"),
            });
        }
        Ok(())
    }

    /// Loads configuration from defaults, configuration files, and the
    /// environment without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("slurmflow")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// `user@host` destination string.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` and `scp`. `control_path` pins the session's
    /// control master socket.
    #[must_use]
    pub fn common_options(&self, control_path: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from("ControlMaster=auto"),
            OsString::from("-o"),
            OsString::from(format!("ControlPath={control_path}")),
            OsString::from("-o"),
            OsString::from(format!("ControlPersist={}", self.control_persist_seconds)),
            OsString::from("-o"),
            OsString::from(format!(
                "ServerAliveInterval={}",
                self.keepalive_interval_seconds
            )),
        ];
        if self.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }
        let strict = if self.strict_host_key_checking {
            "yes"
        } else {
            "no"
        };
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!("StrictHostKeyChecking={strict}")));
        if let Some(known_hosts) = &self.known_hosts_file {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                expand_tilde(known_hosts)
            )));
        }
        if let Some(identity) = &self.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity)));
        }
        args
    }

    fn require_value(value: &str, field: &str) -> Result<(), SshError> {
        Self::require_optional_value(Some(value), field)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SshError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SshError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }
}
