//! Configuration loading via `ortho-config`.
//!
//! Each concern owns one struct: [`crate::ssh::SshConfig`] for the login
//! node, [`HpcConfig`] for cluster paths and polling bounds, and
//! [`MessagingConfig`] for the telemetry bus.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Cluster paths, workflow inputs, and polling bounds.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SLURMFLOW_HPC",
    discovery(
        app_name = "slurmflow",
        env_var = "SLURMFLOW_CONFIG_PATH",
        config_file_name = "slurmflow.toml",
        dotfile_name = ".slurmflow.toml",
        project_file_name = "slurmflow.toml"
    )
)]
pub struct HpcConfig {
    /// Remote directory receiving scripts and Slurm logs.
    #[ortho_config(default = String::new())]
    pub slurm_log_base_path: String,
    /// Remote directory under which each experiment gets an output folder.
    #[ortho_config(default = String::new())]
    pub sim_base_path: String,
    /// Slurm job name prefix.
    #[ortho_config(default = "slurmflow".to_owned())]
    pub job_name: String,
    /// Container image reference passed to the workflow.
    #[ortho_config(default = String::new())]
    pub container_image: String,
    /// Remote path of the simulation input data.
    #[ortho_config(default = String::new())]
    pub sim_data_path: String,
    /// Optional Nextflow profile (`-profile <name>`).
    pub nextflow_profile: Option<String>,
    /// Local directory holding the four workflow templates.
    #[ortho_config(default = "templates".to_owned())]
    pub template_dir: String,
    /// Seconds between Slurm status checks.
    #[ortho_config(default = 30)]
    pub poll_interval_seconds: u64,
    /// Upper bound on waiting for a terminal job state.
    #[ortho_config(default = 7200)]
    pub max_wait_seconds: u64,
    /// Maximum number of output files reported after a run.
    #[ortho_config(default = 5)]
    pub output_listing_limit: usize,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in slurmflow.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl HpcConfig {
    /// Loads configuration from defaults, configuration files, and the
    /// environment without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("slurmflow")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty,
    /// or [`ConfigError::Invalid`] when polling bounds are zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.slurm_log_base_path,
            &FieldMetadata::new(
                "Slurm log directory",
                "SLURMFLOW_HPC_SLURM_LOG_BASE_PATH",
                "slurm_log_base_path",
                "hpc",
            ),
        )?;
        require_field(
            &self.sim_base_path,
            &FieldMetadata::new(
                "simulation output directory",
                "SLURMFLOW_HPC_SIM_BASE_PATH",
                "sim_base_path",
                "hpc",
            ),
        )?;
        require_field(
            &self.job_name,
            &FieldMetadata::new("job name", "SLURMFLOW_HPC_JOB_NAME", "job_name", "hpc"),
        )?;
        require_field(
            &self.container_image,
            &FieldMetadata::new(
                "container image",
                "SLURMFLOW_HPC_CONTAINER_IMAGE",
                "container_image",
                "hpc",
            ),
        )?;
        require_field(
            &self.sim_data_path,
            &FieldMetadata::new(
                "simulation data path",
                "SLURMFLOW_HPC_SIM_DATA_PATH",
                "sim_data_path",
                "hpc",
            ),
        )?;
        require_field(
            &self.template_dir,
            &FieldMetadata::new(
                "template directory",
                "SLURMFLOW_HPC_TEMPLATE_DIR",
                "template_dir",
                "hpc",
            ),
        )?;
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll_interval_seconds must be at least 1",
            )));
        }
        if self.output_listing_limit == 0 {
            return Err(ConfigError::Invalid(String::from(
                "output_listing_limit must be at least 1",
            )));
        }
        Ok(())
    }

    /// Poll cadence as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Maximum wait as a [`Duration`].
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

/// Telemetry bus selection and subject naming.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SLURMFLOW_MESSAGING",
    discovery(
        app_name = "slurmflow",
        env_var = "SLURMFLOW_CONFIG_PATH",
        config_file_name = "slurmflow.toml",
        dotfile_name = ".slurmflow.toml",
        project_file_name = "slurmflow.toml"
    )
)]
pub struct MessagingConfig {
    /// Backend name: `nats` or `redis`.
    #[ortho_config(default = "nats".to_owned())]
    pub backend: String,
    /// Server URL handed to the backend client.
    #[ortho_config(default = "nats://127.0.0.1:4222".to_owned())]
    pub url: String,
    /// Subject prefix; events for simulator `N` arrive on `<prefix>.N`.
    #[ortho_config(default = "simulator".to_owned())]
    pub subject_prefix: String,
    /// Connection timeout in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_seconds: u64,
}

impl MessagingConfig {
    /// Loads configuration from defaults, configuration files, and the
    /// environment without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("slurmflow")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.url,
            &FieldMetadata::new(
                "message bus URL",
                "SLURMFLOW_MESSAGING_URL",
                "url",
                "messaging",
            ),
        )?;
        require_field(
            &self.subject_prefix,
            &FieldMetadata::new(
                "subject prefix",
                "SLURMFLOW_MESSAGING_SUBJECT_PREFIX",
                "subject_prefix",
                "messaging",
            ),
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
