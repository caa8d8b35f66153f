//! Records shared between the Slurm polling flow and event ingestion.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry tick emitted by a running simulation.
///
/// `sequence_number` increases monotonically per `correlation_id`; gaps or
/// repeats indicate loss or redelivery and are left for storage to handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    /// Join key back to the submitted job.
    pub correlation_id: String,
    /// Per-correlation tick counter.
    pub sequence_number: u64,
    /// Mass readings keyed by name; the key set is open.
    #[serde(default)]
    pub mass: BTreeMap<String, f64>,
    /// Simulated seconds at this tick.
    pub time: f64,
    /// Storage identifier, once persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_id: Option<i64>,
    /// Persistence timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Owning [`HpcRun`] identifier, stamped during ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpcrun_id: Option<i64>,
}

impl WorkerEvent {
    /// Decodes an event from the JSON bytes carried on the bus.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed payloads.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encodes the event as the JSON bytes published on the bus.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Kind of work an [`HpcRun`] tracks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Container image build.
    BuildImage,
    /// Parameter calculation run.
    Parca,
    /// Simulation run.
    Simulation,
}

/// Coarse lifecycle status persisted on an [`HpcRun`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued or not yet observed.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl JobStatus {
    /// Whether no further status change is expected.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Persisted lifecycle of one Slurm job tied to an owning entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpcRun {
    /// Storage identifier.
    pub database_id: i64,
    /// Slurm job id, once submitted.
    pub slurmjobid: Option<u64>,
    /// Correlation id embedded in the job environment.
    pub correlation_id: String,
    /// What kind of work this run performs.
    pub job_type: JobType,
    /// Identifier of the owning entity.
    pub ref_id: i64,
    /// Latest known status.
    pub status: JobStatus,
    /// Start time reported by Slurm.
    pub start_time: Option<String>,
    /// End time reported by Slurm.
    pub end_time: Option<String>,
    /// Failure description for unsuccessful runs.
    pub error_message: Option<String>,
}
