//! Two-phase job observation.
//!
//! A single status check yields a [`JobObservation`]: the job is either
//! still in the live queue, has a terminal accounting record, or neither
//! source knows about it yet. [`StatusTracker`] folds successive
//! observations and tolerates exactly one consecutive `Unknown`, covering
//! the brief window where a job has left `squeue` but `sacct` has not
//! recorded it.

use thiserror::Error;

use super::types::SlurmJob;

/// Consecutive `Unknown` observations tolerated before giving up.
pub const TOLERATED_UNKNOWN_OBSERVATIONS: u32 = 1;

/// Outcome of one squeue-then-sacct status check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobObservation {
    /// The job is queued or executing.
    Active(SlurmJob),
    /// The job has finished.
    Terminal(SlurmJob),
    /// Neither source returned a row for the job.
    Unknown,
}

/// Result of folding one observation into a [`StatusTracker`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollStep {
    /// Keep polling.
    Waiting,
    /// A terminal snapshot was observed; stop polling.
    Finished(SlurmJob),
}

/// Raised when a job stays invisible to both `squeue` and `sacct`.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("job {job_id} missing from squeue and sacct for {observations} consecutive checks")]
pub struct JobVanished {
    /// Job being tracked.
    pub job_id: u64,
    /// Consecutive `Unknown` observations seen.
    pub observations: u32,
}

/// Folds observations of one job into a polling decision.
#[derive(Clone, Debug)]
pub struct StatusTracker {
    job_id: u64,
    consecutive_unknown: u32,
    last: Option<SlurmJob>,
}

impl StatusTracker {
    /// Starts tracking `job_id` in the initial unobserved state.
    #[must_use]
    pub const fn new(job_id: u64) -> Self {
        Self {
            job_id,
            consecutive_unknown: 0,
            last: None,
        }
    }

    /// Most recent snapshot, if any observation has returned one.
    #[must_use]
    pub const fn last_snapshot(&self) -> Option<&SlurmJob> {
        self.last.as_ref()
    }

    /// Folds `observation` into the tracker.
    ///
    /// # Errors
    ///
    /// Returns [`JobVanished`] once more than
    /// [`TOLERATED_UNKNOWN_OBSERVATIONS`] consecutive `Unknown`
    /// observations have been seen.
    pub fn observe(&mut self, observation: JobObservation) -> Result<PollStep, JobVanished> {
        match observation {
            JobObservation::Active(job) => {
                self.consecutive_unknown = 0;
                self.last = Some(job);
                Ok(PollStep::Waiting)
            }
            JobObservation::Terminal(job) => {
                self.consecutive_unknown = 0;
                self.last = Some(job.clone());
                Ok(PollStep::Finished(job))
            }
            JobObservation::Unknown => {
                self.consecutive_unknown = self.consecutive_unknown.saturating_add(1);
                if self.consecutive_unknown > TOLERATED_UNKNOWN_OBSERVATIONS {
                    return Err(JobVanished {
                        job_id: self.job_id,
                        observations: self.consecutive_unknown,
                    });
                }
                Ok(PollStep::Waiting)
            }
        }
    }
}
