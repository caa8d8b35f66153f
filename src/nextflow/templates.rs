//! Workflow templates and typed placeholder rendering.
//!
//! Templates carry upper-case tokens from the closed [`Placeholder`] set.
//! [`TemplateValues`] supplies a value for every token, so rendering cannot
//! leave a known token behind; an unrecognised `*_PLACEHOLDER` token or a
//! token reintroduced through a value is reported as a [`TemplateError`]
//! before anything is uploaded.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// File names expected inside a template directory.
pub const MAIN_SCRIPT_FILE: &str = "main.nf";
/// Workflow configuration template file name.
pub const WORKFLOW_CONFIG_FILE: &str = "workflow_config.json";
/// Nextflow execution configuration template file name.
pub const NEXTFLOW_CONFIG_FILE: &str = "nextflow.config";
/// Slurm wrapper template file name.
pub const SBATCH_FILE: &str = "job.sbatch";

/// Every token a template may contain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Placeholder {
    /// Remote path of the rendered `main.nf`.
    NextflowScriptPath,
    /// Remote path of the rendered Nextflow config.
    NextflowConfigPath,
    /// Slurm stdout log.
    RemoteLogOutputFile,
    /// Slurm stderr log.
    RemoteLogErrorFile,
    /// Nextflow HTML report.
    RemoteReportFile,
    /// Nextflow trace file.
    RemoteTraceFile,
    /// Worker event log.
    RemoteEventsFile,
    /// Slurm job name.
    JobName,
    /// Correlation id exported to the worker.
    CorrelationId,
    /// `-profile <name>` or nothing.
    NextflowProfileArgs,
    /// Nextflow work directory.
    WorkDir,
    /// Remote path of the rendered workflow configuration.
    WorkflowConfigPath,
    /// Experiment output directory.
    PublishDir,
    /// Experiment identifier.
    ExperimentId,
    /// Simulation input data.
    SimDataPath,
    /// Container image reference.
    ContainerImage,
}

impl Placeholder {
    /// All placeholders, longest token first.
    pub const ALL: [Self; 16] = [
        Self::ContainerImage,
        Self::CorrelationId,
        Self::ExperimentId,
        Self::SimDataPath,
        Self::PublishDir,
        Self::RemoteLogOutputFile,
        Self::RemoteLogErrorFile,
        Self::NextflowProfileArgs,
        Self::NextflowScriptPath,
        Self::NextflowConfigPath,
        Self::JobName,
        Self::WorkDir,
        Self::WorkflowConfigPath,
        Self::RemoteReportFile,
        Self::RemoteEventsFile,
        Self::RemoteTraceFile,
    ];

    /// Literal token text.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::NextflowScriptPath => "NEXTFLOW_SCRIPT_PATH",
            Self::NextflowConfigPath => "NEXTFLOW_CONFIG_PATH",
            Self::RemoteLogOutputFile => "REMOTE_LOG_OUTPUT_FILE",
            Self::RemoteLogErrorFile => "REMOTE_LOG_ERROR_FILE",
            Self::RemoteReportFile => "REMOTE_REPORT_FILE",
            Self::RemoteTraceFile => "REMOTE_TRACE_FILE",
            Self::RemoteEventsFile => "REMOTE_EVENTS_FILE",
            Self::JobName => "JOB_NAME_PLACEHOLDER",
            Self::CorrelationId => "CORRELATION_ID_PLACEHOLDER",
            Self::NextflowProfileArgs => "NEXTFLOW_PROFILE_ARGS",
            Self::WorkDir => "WORK_DIR_PLACEHOLDER",
            Self::WorkflowConfigPath => "WORKFLOW_CONFIG_PATH",
            Self::PublishDir => "PUBLISH_DIR_PLACEHOLDER",
            Self::ExperimentId => "EXPERIMENT_ID_PLACEHOLDER",
            Self::SimDataPath => "SIM_DATA_PATH_PLACEHOLDER",
            Self::ContainerImage => "CONTAINER_IMAGE_PLACEHOLDER",
        }
    }
}

/// Concrete values for every [`Placeholder`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TemplateValues {
    /// Remote `main.nf` path.
    pub nextflow_script_path: String,
    /// Remote Nextflow config path.
    pub nextflow_config_path: String,
    /// Slurm stdout log path.
    pub remote_log_output_file: String,
    /// Slurm stderr log path.
    pub remote_log_error_file: String,
    /// Report path.
    pub remote_report_file: String,
    /// Trace path.
    pub remote_trace_file: String,
    /// Event log path.
    pub remote_events_file: String,
    /// Slurm job name.
    pub job_name: String,
    /// Correlation id.
    pub correlation_id: String,
    /// Optional Nextflow profile name.
    pub nextflow_profile: Option<String>,
    /// Work directory.
    pub work_dir: String,
    /// Remote workflow configuration path.
    pub workflow_config_path: String,
    /// Output directory.
    pub publish_dir: String,
    /// Experiment id.
    pub experiment_id: String,
    /// Simulation data path.
    pub sim_data_path: String,
    /// Container image.
    pub container_image: String,
}

impl TemplateValues {
    /// Value substituted for `placeholder`.
    #[must_use]
    pub fn value(&self, placeholder: Placeholder) -> String {
        match placeholder {
            Placeholder::NextflowScriptPath => self.nextflow_script_path.clone(),
            Placeholder::NextflowConfigPath => self.nextflow_config_path.clone(),
            Placeholder::RemoteLogOutputFile => self.remote_log_output_file.clone(),
            Placeholder::RemoteLogErrorFile => self.remote_log_error_file.clone(),
            Placeholder::RemoteReportFile => self.remote_report_file.clone(),
            Placeholder::RemoteTraceFile => self.remote_trace_file.clone(),
            Placeholder::RemoteEventsFile => self.remote_events_file.clone(),
            Placeholder::JobName => self.job_name.clone(),
            Placeholder::CorrelationId => self.correlation_id.clone(),
            Placeholder::NextflowProfileArgs => self
                .nextflow_profile
                .as_deref()
                .map(|profile| format!("-profile {profile}"))
                .unwrap_or_default(),
            Placeholder::WorkDir => self.work_dir.clone(),
            Placeholder::WorkflowConfigPath => self.workflow_config_path.clone(),
            Placeholder::PublishDir => self.publish_dir.clone(),
            Placeholder::ExperimentId => self.experiment_id.clone(),
            Placeholder::SimDataPath => self.sim_data_path.clone(),
            Placeholder::ContainerImage => self.container_image.clone(),
        }
    }
}

/// How substituted values are encoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TemplateFormat {
    /// Values are inserted verbatim.
    Text,
    /// Values are inserted as JSON string contents and the result must parse
    /// as JSON.
    Json,
}

/// Errors raised while loading or rendering templates.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// A template file could not be read.
    #[error("failed to read template {path}: {message}")]
    Read {
        /// File that failed.
        path: Utf8PathBuf,
        /// OS error string.
        message: String,
    },
    /// A known token survived rendering.
    #[error("template {template} still contains {token} after rendering")]
    Unsubstituted {
        /// Template name.
        template: String,
        /// Surviving token.
        token: &'static str,
    },
    /// The template uses a placeholder-shaped token outside the known set.
    #[error("template {template} uses unknown placeholder {token}")]
    UnknownPlaceholder {
        /// Template name.
        template: String,
        /// Offending token.
        token: String,
    },
    /// The rendered workflow configuration is not valid JSON.
    #[error("rendered {template} is not valid JSON: {message}")]
    InvalidJson {
        /// Template name.
        template: String,
        /// Parser diagnostic.
        message: String,
    },
}

/// Renders `template` by substituting every known placeholder in one pass.
///
/// Substituted values are not rescanned.
///
/// # Errors
///
/// Returns [`TemplateError::UnknownPlaceholder`] for unrecognised
/// `*_PLACEHOLDER` tokens, [`TemplateError::Unsubstituted`] if a token is
/// still present afterwards, and [`TemplateError::InvalidJson`] when a JSON
/// template does not parse after rendering.
pub fn render(
    name: &str,
    template: &str,
    values: &TemplateValues,
    format: TemplateFormat,
) -> Result<String, TemplateError> {
    if let Some(token) = unknown_placeholder(template) {
        return Err(TemplateError::UnknownPlaceholder {
            template: name.to_owned(),
            token,
        });
    }

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while !rest.is_empty() {
        let matched = Placeholder::ALL
            .iter()
            .find_map(|p| rest.strip_prefix(p.token()).map(|after| (*p, after)));
        if let Some((placeholder, after)) = matched {
            let raw = values.value(placeholder);
            match format {
                TemplateFormat::Text => rendered.push_str(&raw),
                TemplateFormat::Json => rendered.push_str(&json_string_contents(&raw)),
            }
            rest = after;
            continue;
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            rendered.push(c);
        }
        rest = chars.as_str();
    }

    if let Some(survivor) = Placeholder::ALL
        .iter()
        .find(|placeholder| rendered.contains(placeholder.token()))
    {
        return Err(TemplateError::Unsubstituted {
            template: name.to_owned(),
            token: survivor.token(),
        });
    }

    if format == TemplateFormat::Json
        && let Err(err) = serde_json::from_str::<serde_json::Value>(&rendered)
    {
        return Err(TemplateError::InvalidJson {
            template: name.to_owned(),
            message: err.to_string(),
        });
    }
    Ok(rendered)
}

fn json_string_contents(raw: &str) -> String {
    let quoted = serde_json::Value::String(raw.to_owned()).to_string();
    quoted
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map_or_else(|| quoted.clone(), str::to_owned)
}

fn unknown_placeholder(template: &str) -> Option<String> {
    template
        .split(|c: char| !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'))
        .filter(|word| word.ends_with("_PLACEHOLDER"))
        .find(|word| !Placeholder::ALL.iter().any(|p| p.token() == *word))
        .map(str::to_owned)
}

/// The four templates that make up one workflow submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateSet {
    /// Nextflow main script.
    pub main_script: String,
    /// Workflow configuration JSON.
    pub workflow_config: String,
    /// Nextflow execution configuration.
    pub nextflow_config: String,
    /// Slurm wrapper script.
    pub sbatch: String,
}

impl TemplateSet {
    /// Builds a set from in-memory strings.
    #[must_use]
    pub fn from_strings(
        main_script: impl Into<String>,
        workflow_config: impl Into<String>,
        nextflow_config: impl Into<String>,
        sbatch: impl Into<String>,
    ) -> Self {
        Self {
            main_script: main_script.into(),
            workflow_config: workflow_config.into(),
            nextflow_config: nextflow_config.into(),
            sbatch: sbatch.into(),
        }
    }

    /// Reads `main.nf`, `workflow_config.json`, `nextflow.config`, and
    /// `job.sbatch` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Read`] naming the first unreadable file.
    pub fn load(dir: &Utf8Path) -> Result<Self, TemplateError> {
        let handle =
            Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| TemplateError::Read {
                path: dir.to_path_buf(),
                message: err.to_string(),
            })?;
        let read = |file: &str| {
            handle
                .read_to_string(file)
                .map_err(|err| TemplateError::Read {
                    path: dir.join(file),
                    message: err.to_string(),
                })
        };
        Ok(Self {
            main_script: read(MAIN_SCRIPT_FILE)?,
            workflow_config: read(WORKFLOW_CONFIG_FILE)?,
            nextflow_config: read(NEXTFLOW_CONFIG_FILE)?,
            sbatch: read(SBATCH_FILE)?,
        })
    }
}
