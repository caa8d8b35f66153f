//! Nextflow workflows submitted as single Slurm jobs.
//!
//! [`NextflowServiceSlurm`] renders the workflow templates for one
//! experiment, uploads them through an [`SshSession`], submits the sbatch
//! wrapper, polls the job to a terminal state, and lists what it produced.
//! [`NextflowServiceSlurm::run_simulation`] composes the three steps over a
//! single session that is closed on every exit path.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HpcConfig;
use crate::slurm::{PollStep, SlurmJob, SlurmJobState, SlurmService, StatusTracker};
use crate::ssh::{CommandRunner, SshSession, SshSessionService};

mod error;
mod layout;
mod staging;
mod templates;

pub use error::NextflowJobError;
pub use layout::{LogPaths, RemoteLayout};
pub use staging::{RenderedArtifacts, StagedArtifacts};
pub use templates::{
    MAIN_SCRIPT_FILE, NEXTFLOW_CONFIG_FILE, Placeholder, SBATCH_FILE, TemplateError,
    TemplateFormat, TemplateSet, TemplateValues, WORKFLOW_CONFIG_FILE, render,
};

/// Handle returned once a workflow job has been accepted by Slurm.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NextflowJobSubmission {
    /// Slurm job id.
    pub job_id: u64,
    /// Unique Slurm job name rendered into the sbatch script.
    pub job_name: String,
    /// Correlation id exported to the worker for telemetry.
    pub correlation_id: String,
    /// Slurm stdout log.
    pub remote_output_file: String,
    /// Slurm stderr log.
    pub remote_error_file: String,
    /// Directory the workflow publishes results into.
    pub simulation_output_dir: String,
}

impl NextflowJobSubmission {
    /// Log paths carried by lifecycle errors for this job.
    #[must_use]
    pub fn logs(&self) -> LogPaths {
        LogPaths {
            output: self.remote_output_file.clone(),
            error: self.remote_error_file.clone(),
        }
    }
}

/// Shortest sleep between two status checks of the same job.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence and bound for [`NextflowServiceSlurm::poll_simulation_job`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Sleep between status checks. Values below [`MIN_POLL_INTERVAL`] are
    /// raised to it.
    pub poll_interval: Duration,
    /// Give up once this much time has elapsed without a terminal state.
    pub max_wait: Duration,
}

impl PollPolicy {
    /// Policy taken from the HPC configuration.
    #[must_use]
    pub const fn from_config(config: &HpcConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_wait: config.max_wait(),
        }
    }
}

/// Result of a full submit, poll, and list lifecycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimulationRun {
    /// Accepted submission.
    pub submission: NextflowJobSubmission,
    /// Terminal `COMPLETED` snapshot.
    pub job: SlurmJob,
    /// Output files found in the experiment directory.
    pub outputs: Vec<String>,
}

/// Everything needed to upload and submit one workflow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PreparedSubmission {
    /// Remote paths for this submission.
    pub layout: RemoteLayout,
    /// Correlation id rendered into the sbatch script.
    pub correlation_id: String,
    /// Rendered file contents.
    pub artifacts: RenderedArtifacts,
}

/// Runs Nextflow workflows on the cluster through Slurm.
#[derive(Debug)]
pub struct NextflowServiceSlurm<R: CommandRunner> {
    ssh: SshSessionService<R>,
    slurm: SlurmService,
    config: HpcConfig,
    templates: TemplateSet,
    new_id: fn() -> Uuid,
}

impl<R: CommandRunner> NextflowServiceSlurm<R> {
    /// Creates the service from its collaborators.
    #[must_use]
    pub const fn new(
        ssh: SshSessionService<R>,
        slurm: SlurmService,
        config: HpcConfig,
        templates: TemplateSet,
    ) -> Self {
        Self {
            ssh,
            slurm,
            config,
            templates,
            new_id: Uuid::new_v4,
        }
    }

    /// Replaces the source of job-name suffixes and correlation ids.
    #[must_use]
    pub const fn with_id_source(mut self, new_id: fn() -> Uuid) -> Self {
        self.new_id = new_id;
        self
    }

    /// HPC configuration in use.
    #[must_use]
    pub const fn config(&self) -> &HpcConfig {
        &self.config
    }

    /// Generates a unique job name and correlation id and renders every
    /// template for `experiment_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] when a template cannot be fully rendered.
    pub fn prepare_submission(&self, experiment_id: &str) -> Result<PreparedSubmission, TemplateError> {
        let suffix: String = (self.new_id)().simple().to_string().chars().take(8).collect();
        let job_name = format!("{}_{suffix}", self.config.job_name);
        let correlation_id = (self.new_id)().to_string();
        let layout = RemoteLayout::new(
            &self.config.slurm_log_base_path,
            &self.config.sim_base_path,
            &job_name,
            experiment_id,
        );
        let values = TemplateValues {
            nextflow_script_path: layout.nextflow_script.clone(),
            nextflow_config_path: layout.nextflow_config.clone(),
            remote_log_output_file: layout.output_log.clone(),
            remote_log_error_file: layout.error_log.clone(),
            remote_report_file: layout.report.clone(),
            remote_trace_file: layout.trace.clone(),
            remote_events_file: layout.events.clone(),
            job_name: job_name.clone(),
            correlation_id: correlation_id.clone(),
            nextflow_profile: self.config.nextflow_profile.clone(),
            work_dir: layout.work_dir.clone(),
            workflow_config_path: layout.workflow_config.clone(),
            publish_dir: layout.output_dir.clone(),
            experiment_id: experiment_id.to_owned(),
            sim_data_path: self.config.sim_data_path.clone(),
            container_image: self.config.container_image.clone(),
        };

        let artifacts = RenderedArtifacts {
            nextflow_script: render(
                MAIN_SCRIPT_FILE,
                &self.templates.main_script,
                &values,
                TemplateFormat::Text,
            )?,
            nextflow_config: render(
                NEXTFLOW_CONFIG_FILE,
                &self.templates.nextflow_config,
                &values,
                TemplateFormat::Text,
            )?,
            workflow_config: render(
                WORKFLOW_CONFIG_FILE,
                &self.templates.workflow_config,
                &values,
                TemplateFormat::Json,
            )?,
            sbatch: render(SBATCH_FILE, &self.templates.sbatch, &values, TemplateFormat::Text)?,
        };
        Ok(PreparedSubmission {
            layout,
            correlation_id,
            artifacts,
        })
    }

    /// Renders, uploads, and submits the workflow for `experiment_id`.
    ///
    /// Rendering happens before anything touches the cluster; the output
    /// directory is created before the uploads.
    ///
    /// # Errors
    ///
    /// Returns [`NextflowJobError::Template`] for rendering failures,
    /// [`NextflowJobError::Staging`] when local files cannot be written, and
    /// transport or submission errors from the SSH and Slurm layers.
    pub async fn submit_simulation_job(
        &self,
        session: &SshSession<R>,
        experiment_id: &str,
    ) -> Result<NextflowJobSubmission, NextflowJobError> {
        let prepared = self.prepare_submission(experiment_id)?;
        let layout = &prepared.layout;
        let staged = StagedArtifacts::stage(&prepared.artifacts)?;

        session
            .run_command(&format!(
                "mkdir -p {}",
                shell_escape::escape(layout.output_dir.as_str().into())
            ))
            .await?;
        session
            .scp_upload(&staged.nextflow_script(), &layout.nextflow_script)
            .await?;
        session
            .scp_upload(&staged.nextflow_config(), &layout.nextflow_config)
            .await?;
        session
            .scp_upload(&staged.workflow_config(), &layout.workflow_config)
            .await?;
        let job_id = self
            .slurm
            .submit_job(session, &staged.sbatch(), &layout.sbatch_script)
            .await?;
        drop(staged);

        info!(
            job_id,
            job_name = %layout.job_name,
            correlation_id = %prepared.correlation_id,
            output_dir = %layout.output_dir,
            "submitted Nextflow workflow"
        );
        Ok(NextflowJobSubmission {
            job_id,
            job_name: layout.job_name.clone(),
            correlation_id: prepared.correlation_id.clone(),
            remote_output_file: layout.output_log.clone(),
            remote_error_file: layout.error_log.clone(),
            simulation_output_dir: layout.output_dir.clone(),
        })
    }

    /// Polls `submission` until Slurm reports a terminal state.
    ///
    /// Each check runs squeue, falling back to sacct once the job has left
    /// the live queue. One check in which neither source knows the job is
    /// tolerated; a second consecutive one is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`NextflowJobError::Timeout`] when `policy.max_wait` elapses,
    /// [`NextflowJobError::JobNotFound`] when the job vanishes,
    /// [`NextflowJobError::NameMismatch`] when the terminal job carries a
    /// different name, and [`NextflowJobError::NotCompleted`] for any
    /// terminal state other than `COMPLETED`.
    pub async fn poll_simulation_job(
        &self,
        session: &SshSession<R>,
        submission: &NextflowJobSubmission,
        policy: PollPolicy,
    ) -> Result<SlurmJob, NextflowJobError> {
        let job_id = submission.job_id;
        let started = Instant::now();
        let mut tracker = StatusTracker::new(job_id);
        loop {
            let observation = self.slurm.observe_job(session, job_id).await?;
            debug!(job_id, ?observation, "polled Slurm job");
            match tracker.observe(observation) {
                Ok(PollStep::Finished(job)) => return verify_terminal(submission, job),
                Ok(PollStep::Waiting) => {}
                Err(vanished) => {
                    warn!(job_id, observations = vanished.observations, "job vanished");
                    return Err(NextflowJobError::JobNotFound {
                        job_id,
                        logs: submission.logs(),
                    });
                }
            }

            let elapsed = started.elapsed();
            let Some(remaining) = policy.max_wait.checked_sub(elapsed).filter(|d| !d.is_zero())
            else {
                let last_state = tracker
                    .last_snapshot()
                    .map_or_else(|| String::from("UNKNOWN"), |job| job.job_state.to_string());
                return Err(NextflowJobError::Timeout {
                    job_id,
                    waited_seconds: elapsed.as_secs(),
                    last_state,
                    logs: submission.logs(),
                });
            };
            let interval = policy.poll_interval.max(MIN_POLL_INTERVAL);
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    /// Lists up to `output_listing_limit` files under the submission's
    /// output directory.
    ///
    /// # Errors
    ///
    /// Returns [`NextflowJobError::EmptyOutput`] when no files are found and
    /// [`NextflowJobError::Ssh`] when the listing command fails.
    pub async fn list_simulation_outputs(
        &self,
        session: &SshSession<R>,
        submission: &NextflowJobSubmission,
    ) -> Result<Vec<String>, NextflowJobError> {
        let command = format!(
            "find {} -type f | head -n {}",
            shell_escape::escape(submission.simulation_output_dir.as_str().into()),
            self.config.output_listing_limit
        );
        let output = session.run_command(&command).await?;
        let files: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        if files.is_empty() {
            return Err(NextflowJobError::EmptyOutput {
                job_id: submission.job_id,
                output_dir: submission.simulation_output_dir.clone(),
                logs: submission.logs(),
            });
        }
        info!(
            job_id = submission.job_id,
            count = files.len(),
            "listed simulation outputs"
        );
        Ok(files)
    }

    /// Submits, polls, and lists outputs over one SSH session.
    ///
    /// # Errors
    ///
    /// Returns the first error from any step. The session is closed before
    /// returning in every case.
    pub async fn run_simulation(
        &self,
        experiment_id: &str,
        policy: PollPolicy,
    ) -> Result<SimulationRun, NextflowJobError> {
        let session = self.ssh.session().await?;
        let result = self.run_lifecycle(&session, experiment_id, policy).await;
        session.close().await;
        result
    }

    async fn run_lifecycle(
        &self,
        session: &SshSession<R>,
        experiment_id: &str,
        policy: PollPolicy,
    ) -> Result<SimulationRun, NextflowJobError> {
        let submission = self.submit_simulation_job(session, experiment_id).await?;
        let job = self
            .poll_simulation_job(session, &submission, policy)
            .await?;
        let outputs = self.list_simulation_outputs(session, &submission).await?;
        Ok(SimulationRun {
            submission,
            job,
            outputs,
        })
    }
}

fn verify_terminal(
    submission: &NextflowJobSubmission,
    job: SlurmJob,
) -> Result<SlurmJob, NextflowJobError> {
    if job.name != submission.job_name {
        return Err(NextflowJobError::NameMismatch {
            job_id: job.job_id,
            expected: submission.job_name.clone(),
            actual: job.name,
            logs: submission.logs(),
        });
    }
    if job.job_state != SlurmJobState::Completed {
        return Err(NextflowJobError::NotCompleted {
            job_id: job.job_id,
            state: job.job_state,
            exit_code: job.exit_code,
            logs: submission.logs(),
        });
    }
    info!(job_id = job.job_id, "workflow job completed");
    Ok(job)
}

#[cfg(test)]
mod tests;
