//! Error types for the workflow lifecycle.

use thiserror::Error;

use super::layout::LogPaths;
use super::templates::TemplateError;
use crate::slurm::{SlurmError, SlurmJobState};
use crate::ssh::SshError;

/// Errors raised while submitting, polling, or collecting a workflow job.
///
/// Lifecycle variants carry the Slurm log paths so an operator can inspect
/// the job without re-deriving them.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NextflowJobError {
    /// No terminal state was observed within the wait bound.
    #[error(
        "job {job_id} did not reach a terminal state within {waited_seconds}s \
         (last seen {last_state}); {logs}"
    )]
    Timeout {
        /// Slurm job id.
        job_id: u64,
        /// Seconds waited.
        waited_seconds: u64,
        /// Last observed state, or `UNKNOWN`.
        last_state: String,
        /// Slurm logs.
        logs: LogPaths,
    },
    /// Neither squeue nor sacct reported the job on consecutive checks.
    #[error("job {job_id} disappeared from squeue and sacct; {logs}")]
    JobNotFound {
        /// Slurm job id.
        job_id: u64,
        /// Slurm logs.
        logs: LogPaths,
    },
    /// The terminal job does not carry the submitted name.
    #[error("job {job_id} is named {actual}, expected {expected}; {logs}")]
    NameMismatch {
        /// Slurm job id.
        job_id: u64,
        /// Name rendered into the sbatch script.
        expected: String,
        /// Name reported by Slurm.
        actual: String,
        /// Slurm logs.
        logs: LogPaths,
    },
    /// The job finished in a state other than `COMPLETED`.
    #[error("job {job_id} ended {state}{}; {logs}", exit_suffix(*exit_code))]
    NotCompleted {
        /// Slurm job id.
        job_id: u64,
        /// Terminal state reported by Slurm.
        state: SlurmJobState,
        /// Exit code, when accounting recorded one.
        exit_code: Option<i32>,
        /// Slurm logs.
        logs: LogPaths,
    },
    /// The job completed but left no files in its output directory.
    #[error("job {job_id} completed but {output_dir} contains no files; {logs}")]
    EmptyOutput {
        /// Slurm job id.
        job_id: u64,
        /// Directory that was listed.
        output_dir: String,
        /// Slurm logs.
        logs: LogPaths,
    },
    /// A template failed to render.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Local artifacts could not be written.
    #[error("failed to stage {path}: {message}")]
    Staging {
        /// Local path being written.
        path: String,
        /// OS error string.
        message: String,
    },
    /// Submission or status query failed.
    #[error(transparent)]
    Slurm(#[from] SlurmError),
    /// Transport failure outside Slurm commands.
    #[error(transparent)]
    Ssh(#[from] SshError),
}

fn exit_suffix(exit_code: Option<i32>) -> String {
    exit_code.map_or_else(String::new, |code| format!(" with exit code {code}"))
}
