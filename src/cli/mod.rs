//! Command-line interface definitions for the `slurmflow` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `slurmflow` binary.
#[derive(Debug, Parser)]
#[command(
    name = "slurmflow",
    about = "Run Nextflow workflows on a Slurm cluster and ingest their telemetry",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Submit a workflow, wait for it, and list its outputs.
    #[command(name = "run", about = "Submit a workflow, wait for it, and list its outputs")]
    Run(RunCommand),
    /// Show the current Slurm state of a job.
    #[command(name = "status", about = "Show the current Slurm state of a job")]
    Status(StatusCommand),
    /// Store worker events for a simulator until interrupted.
    #[command(name = "listen", about = "Store worker events for a simulator until interrupted")]
    Listen(ListenCommand),
}

/// Arguments for the `slurmflow run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Experiment identifier; names the output directory under
    /// `sim_base_path`. A random identifier is generated when omitted.
    #[arg(long, value_name = "ID")]
    pub(crate) experiment_id: Option<String>,
    /// Simulator the run is registered under.
    #[arg(long, value_name = "SIMULATOR_ID", default_value_t = 0)]
    pub(crate) simulator_id: i64,
    /// Store worker events from `<prefix>.<SIMULATOR_ID>` while the job runs.
    #[arg(long)]
    pub(crate) listen: bool,
}

/// Arguments for the `slurmflow status` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct StatusCommand {
    /// Slurm job id to look up.
    #[arg(value_name = "JOB_ID")]
    pub(crate) job_id: u64,
}

/// Arguments for the `slurmflow listen` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ListenCommand {
    /// Simulator whose `<prefix>.<SIMULATOR_ID>` subject is consumed.
    #[arg(value_name = "SIMULATOR_ID")]
    pub(crate) simulator_id: i64,
    /// Job submitted earlier, as `JOB_ID:CORRELATION_ID`. Events for other
    /// correlation ids are dropped.
    #[arg(
        long = "track",
        value_name = "JOB_ID:CORRELATION_ID",
        value_parser = parse_tracked_job,
        required = true
    )]
    pub(crate) tracked: Vec<TrackedJob>,
    /// Also refresh tracked jobs from Slurm every N seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) poll_seconds: Option<u64>,
}

/// Slurm job id paired with the correlation id its worker reports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TrackedJob {
    pub(crate) job_id: u64,
    pub(crate) correlation_id: String,
}

fn parse_tracked_job(value: &str) -> Result<TrackedJob, String> {
    let (raw_job_id, correlation_id) = value
        .split_once(':')
        .ok_or_else(|| format!("expected JOB_ID:CORRELATION_ID, got `{value}`"))?;
    let job_id = raw_job_id
        .parse::<u64>()
        .map_err(|err| format!("invalid job id `{raw_job_id}`: {err}"))?;
    if correlation_id.trim().is_empty() {
        return Err(String::from("correlation id must not be empty"));
    }
    Ok(TrackedJob {
        job_id,
        correlation_id: correlation_id.to_owned(),
    })
}
