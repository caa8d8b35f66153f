//! Errors raised by [`super::SlurmService`].

use thiserror::Error;

use crate::ssh::SshError;

/// Errors surfaced while submitting or querying Slurm jobs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SlurmError {
    /// `sbatch` rejected the script or printed no job id.
    #[error("sbatch for {script} returned no job id: {output}")]
    Submission {
        /// Remote script path.
        script: String,
        /// Truncated stderr of a failed `sbatch`, otherwise its stdout.
        output: String,
    },
    /// A status line could not be interpreted.
    #[error("cannot parse {source_command} output line `{line}`: {reason}")]
    Parse {
        /// `squeue` or `sacct`.
        source_command: &'static str,
        /// Offending line.
        line: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A single-job query matched several rows.
    #[error("{count} jobs reported for job id {job_id}")]
    Ambiguous {
        /// Queried job id.
        job_id: u64,
        /// Number of rows returned.
        count: usize,
    },
    /// Transport failure.
    #[error(transparent)]
    Ssh(#[from] SshError),
}
