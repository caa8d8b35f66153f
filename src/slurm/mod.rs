//! Slurm submission and status queries over an SSH session.

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::ssh::{CommandRunner, ExecutionFailure, SshError, SshSession};

mod error;
mod observe;
mod parse;
mod types;

pub use error::SlurmError;
pub use observe::{
    JobObservation, JobVanished, PollStep, StatusTracker, TOLERATED_UNKNOWN_OBSERVATIONS,
};
pub use parse::{
    SACCT_FIELDS, SQUEUE_FORMAT, parse_sacct_output, parse_sbatch_output, parse_squeue_output,
};
pub use types::{SlurmJob, SlurmJobState};

/// Marker squeue prints when asked about a job that has left the queue.
const INVALID_JOB_ID: &str = "Invalid job id";

/// Stateless front end to `sbatch`, `squeue`, and `sacct`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlurmService;

impl SlurmService {
    /// Creates the service.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Uploads `local_sbatch_file` to `remote_sbatch_file` and submits it.
    ///
    /// # Errors
    ///
    /// Returns [`SlurmError::Submission`] when `sbatch` exits non-zero or
    /// prints no job id, and [`SlurmError::Ssh`] when the upload or the
    /// connection fails.
    pub async fn submit_job<R: CommandRunner>(
        &self,
        session: &SshSession<R>,
        local_sbatch_file: &Utf8Path,
        remote_sbatch_file: &str,
    ) -> Result<u64, SlurmError> {
        session
            .scp_upload(local_sbatch_file, remote_sbatch_file)
            .await?;
        let command = format!("sbatch {}", shell_escape::escape(remote_sbatch_file.into()));
        let output = match session.run_command(&command).await {
            Ok(output) => output,
            Err(SshError::Execution {
                reason: ExecutionFailure::ExitStatus(code),
                stderr,
                ..
            }) => {
                warn!(code, script = remote_sbatch_file, "sbatch rejected the job");
                return Err(SlurmError::Submission {
                    script: remote_sbatch_file.to_owned(),
                    output: stderr,
                });
            }
            Err(err) => return Err(err.into()),
        };
        let job_id = parse_sbatch_output(remote_sbatch_file, &output.stdout)?;
        info!(job_id, script = remote_sbatch_file, "submitted Slurm job");
        Ok(job_id)
    }

    /// Queries the live queue. Jobs that already left the queue are simply
    /// absent from the result.
    ///
    /// # Errors
    ///
    /// Returns [`SlurmError::Ssh`] for transport or command failures other
    /// than an unknown job id, and [`SlurmError::Parse`] for malformed output.
    pub async fn get_job_status_squeue<R: CommandRunner>(
        &self,
        session: &SshSession<R>,
        job_ids: &[u64],
    ) -> Result<Vec<SlurmJob>, SlurmError> {
        let command = format!(
            "squeue -u $USER --format='{SQUEUE_FORMAT}'{}",
            job_filter(job_ids)
        );
        match session.run_command(&command).await {
            Ok(output) => parse_squeue_output(&output.stdout),
            Err(SshError::Execution { stderr, .. }) if stderr.contains(INVALID_JOB_ID) => {
                debug!(?job_ids, "squeue no longer knows the requested jobs");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Queries the accounting store for allocation rows, skipping job steps.
    ///
    /// # Errors
    ///
    /// Returns [`SlurmError::Ssh`] for transport or command failures and
    /// [`SlurmError::Parse`] for malformed output.
    pub async fn get_job_status_sacct<R: CommandRunner>(
        &self,
        session: &SshSession<R>,
        job_ids: &[u64],
    ) -> Result<Vec<SlurmJob>, SlurmError> {
        let command = format!(
            "sacct -u $USER -X --parsable2 --format={SACCT_FIELDS}{}",
            job_filter(job_ids)
        );
        let output = session.run_command(&command).await?;
        parse_sacct_output(&output.stdout)
    }

    /// Looks `job_id` up in squeue, then sacct.
    ///
    /// # Errors
    ///
    /// Returns [`SlurmError::Ambiguous`] when more than one row matches, or
    /// any error from the underlying queries.
    pub async fn get_job_status<R: CommandRunner>(
        &self,
        session: &SshSession<R>,
        job_id: u64,
    ) -> Result<Option<SlurmJob>, SlurmError> {
        let mut jobs = self.get_job_status_squeue(session, &[job_id]).await?;
        if jobs.is_empty() {
            jobs = self.get_job_status_sacct(session, &[job_id]).await?;
        }
        if jobs.len() > 1 {
            return Err(SlurmError::Ambiguous {
                job_id,
                count: jobs.len(),
            });
        }
        let job = jobs.pop();
        if job.is_none() {
            warn!(job_id, "job not found in squeue or sacct");
        }
        Ok(job)
    }

    /// Performs one two-phase status check for `job_id`.
    ///
    /// A non-terminal squeue row means the job is active. Otherwise sacct is
    /// authoritative; if it has no row yet, a terminal squeue row is used,
    /// and with neither the observation is `Unknown`.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying queries.
    pub async fn observe_job<R: CommandRunner>(
        &self,
        session: &SshSession<R>,
        job_id: u64,
    ) -> Result<JobObservation, SlurmError> {
        let live = self
            .get_job_status_squeue(session, &[job_id])
            .await?
            .into_iter()
            .find(|job| job.job_id == job_id);
        if let Some(job) = &live
            && !job.is_done()
        {
            return Ok(JobObservation::Active(job.clone()));
        }

        let accounted = self
            .get_job_status_sacct(session, &[job_id])
            .await?
            .into_iter()
            .find(|job| job.job_id == job_id);
        Ok(match (accounted, live) {
            (Some(job), _) if job.is_done() => JobObservation::Terminal(job),
            (Some(job), _) => JobObservation::Active(job),
            (None, Some(job)) => JobObservation::Terminal(job),
            (None, None) => JobObservation::Unknown,
        })
    }
}

fn job_filter(job_ids: &[u64]) -> String {
    if job_ids.is_empty() {
        return String::new();
    }
    let joined = job_ids
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(" -j {joined}")
}

#[cfg(test)]
mod tests;
