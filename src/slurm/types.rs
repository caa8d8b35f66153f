//! Slurm job state model.

use std::fmt;

use tracing::warn;

use crate::models::JobStatus;

/// State reported by `squeue` or `sacct`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlurmJobState {
    /// Waiting for resources.
    Pending,
    /// Nodes are being prepared.
    Configuring,
    /// Executing.
    Running,
    /// Finishing; some processes may still be active.
    Completing,
    /// Execution suspended.
    Suspended,
    /// Finished with exit code zero.
    Completed,
    /// Finished with a non-zero exit code or other failure.
    Failed,
    /// Cancelled by a user or administrator.
    Cancelled,
    /// Hit its time limit.
    Timeout,
    /// Terminated by a node failure.
    NodeFail,
    /// Killed for exceeding its memory limit.
    OutOfMemory,
    /// Preempted by a higher priority job.
    Preempted,
    /// Failed to launch.
    BootFail,
    /// Missed its deadline.
    Deadline,
    /// Any state this crate does not model, kept verbatim.
    Unknown(String),
}

impl SlurmJobState {
    /// Parses long names (`RUNNING`), short codes (`R`), and sacct's
    /// annotated forms (`CANCELLED by 1234`, `CANCELLED+`).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let head = raw
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .to_ascii_uppercase();
        match head.as_str() {
            "PENDING" | "PD" => Self::Pending,
            "CONFIGURING" | "CF" => Self::Configuring,
            "RUNNING" | "R" => Self::Running,
            "COMPLETING" | "CG" => Self::Completing,
            "SUSPENDED" | "S" => Self::Suspended,
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" => Self::Failed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "TIMEOUT" | "TO" => Self::Timeout,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "OUT_OF_MEMORY" | "OOM" => Self::OutOfMemory,
            "PREEMPTED" | "PR" => Self::Preempted,
            "BOOT_FAIL" | "BF" => Self::BootFail,
            "DEADLINE" | "DL" => Self::Deadline,
            _ => Self::Unknown(raw.trim().to_owned()),
        }
    }

    /// Whether the job has finished and will not change state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::NodeFail
                | Self::OutOfMemory
                | Self::Preempted
                | Self::BootFail
                | Self::Deadline
        )
    }

    /// Canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Configuring => "CONFIGURING",
            Self::Running => "RUNNING",
            Self::Completing => "COMPLETING",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::NodeFail => "NODE_FAIL",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Preempted => "PREEMPTED",
            Self::BootFail => "BOOT_FAIL",
            Self::Deadline => "DEADLINE",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for SlurmJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one job from a single status query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlurmJob {
    /// Numeric Slurm job id.
    pub job_id: u64,
    /// Job name as submitted.
    pub name: String,
    /// Reported state.
    pub job_state: SlurmJobState,
    /// Exit code, only reported by `sacct`.
    pub exit_code: Option<i32>,
    /// Start time, only reported by `sacct`.
    pub start_time: Option<String>,
    /// End time, only reported by `sacct`.
    pub end_time: Option<String>,
    /// Elapsed wall time, only reported by `sacct`.
    pub elapsed: Option<String>,
}

impl SlurmJob {
    /// Whether the snapshot is in a terminal state.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.job_state.is_terminal()
    }

    /// Maps the Slurm state to the coarse status persisted on an `HpcRun`.
    ///
    /// Unmodelled states map to [`JobStatus::Pending`] with a warning.
    #[must_use]
    pub fn job_status(&self) -> JobStatus {
        match &self.job_state {
            SlurmJobState::Pending | SlurmJobState::Configuring => JobStatus::Pending,
            SlurmJobState::Running | SlurmJobState::Completing | SlurmJobState::Suspended => {
                JobStatus::Running
            }
            SlurmJobState::Completed => JobStatus::Completed,
            SlurmJobState::Failed
            | SlurmJobState::Cancelled
            | SlurmJobState::Timeout
            | SlurmJobState::NodeFail
            | SlurmJobState::OutOfMemory
            | SlurmJobState::Preempted
            | SlurmJobState::BootFail
            | SlurmJobState::Deadline => JobStatus::Failed,
            SlurmJobState::Unknown(raw) => {
                warn!(job_id = self.job_id, state = %raw, "unknown Slurm state, treating as pending");
                JobStatus::Pending
            }
        }
    }
}

impl fmt::Display for SlurmJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.job_id, self.name, self.job_state)?;
        if let Some(code) = self.exit_code {
            write!(f, " exit={code}")?;
        }
        Ok(())
    }
}
