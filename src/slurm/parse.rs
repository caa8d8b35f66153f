//! Parsers for `sbatch`, `squeue`, and `sacct` output.
//!
//! Status output is requested with `|`-delimited named fields and a header
//! row; columns are located by header name so reordering or extra fields on
//! the cluster side do not shift values.

use super::error::SlurmError;
use super::types::{SlurmJob, SlurmJobState};
use crate::ssh::truncate_for_diagnostics;

/// `squeue --format` string; the header row names each column.
pub const SQUEUE_FORMAT: &str = "%i|%j|%T";

/// `sacct --format` field list.
pub const SACCT_FIELDS: &str = "JobIDRaw,JobName,State,ExitCode,Start,End,Elapsed";

const SUBMITTED_PREFIX: &str = "Submitted batch job";

/// Extracts the job id from `sbatch` stdout.
///
/// Accepts the standard `Submitted batch job N` line as well as the bare
/// `N` or `N;cluster` form printed with `--parsable`.
///
/// # Errors
///
/// Returns [`SlurmError::Submission`] when no positive id is present.
pub fn parse_sbatch_output(script: &str, stdout: &str) -> Result<u64, SlurmError> {
    let from_line = |line: &str| -> Option<u64> {
        let trimmed = line.trim();
        let candidate = trimmed.strip_prefix(SUBMITTED_PREFIX).map_or_else(
            || trimmed.split(';').next().unwrap_or_default(),
            |rest| rest.split_whitespace().next().unwrap_or_default(),
        );
        candidate.parse::<u64>().ok().filter(|id| *id > 0)
    };
    stdout
        .lines()
        .find_map(from_line)
        .ok_or_else(|| SlurmError::Submission {
            script: script.to_owned(),
            output: truncate_for_diagnostics(stdout),
        })
}

#[derive(Debug)]
struct Columns {
    job_id: usize,
    name: usize,
    state: usize,
    exit_code: Option<usize>,
    start: Option<usize>,
    end: Option<usize>,
    elapsed: Option<usize>,
}

impl Columns {
    fn from_header(source_command: &'static str, header: &str) -> Result<Self, SlurmError> {
        let names: Vec<String> = header
            .split('|')
            .map(|name| name.trim().to_ascii_uppercase())
            .collect();
        let find = |aliases: &[&str]| names.iter().position(|n| aliases.contains(&n.as_str()));
        let require = |aliases: &[&str]| {
            find(aliases).ok_or_else(|| SlurmError::Parse {
                source_command,
                line: header.to_owned(),
                reason: format!("header lacks {}", aliases.join("/")),
            })
        };
        Ok(Self {
            job_id: require(&["JOBIDRAW", "JOBID"])?,
            name: require(&["JOBNAME", "NAME"])?,
            state: require(&["STATE"])?,
            exit_code: find(&["EXITCODE"]),
            start: find(&["START"]),
            end: find(&["END"]),
            elapsed: find(&["ELAPSED"]),
        })
    }

    fn row(&self, source_command: &'static str, line: &str) -> Result<Option<SlurmJob>, SlurmError> {
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        let parse_error = |reason: String| SlurmError::Parse {
            source_command,
            line: line.to_owned(),
            reason,
        };
        let field = |index: usize| {
            fields
                .get(index)
                .copied()
                .ok_or_else(|| parse_error(format!("missing column {index}")))
        };
        let optional = |index: Option<usize>| {
            index
                .and_then(|i| fields.get(i).copied())
                .filter(|value| !value.is_empty() && *value != "Unknown" && *value != "None")
                .map(str::to_owned)
        };

        let raw_id = field(self.job_id)?;
        // Job steps (`123.batch`, `123.extern`, `123.0`) are accounted
        // separately and never describe the allocation itself.
        if raw_id.contains('.') {
            return Ok(None);
        }
        let job_id = raw_id
            .parse::<u64>()
            .map_err(|err| parse_error(format!("job id `{raw_id}`: {err}")))?;
        let exit_code = match optional(self.exit_code) {
            Some(raw) => {
                let status = raw.split(':').next().unwrap_or_default();
                Some(
                    status
                        .parse::<i32>()
                        .map_err(|err| parse_error(format!("exit code `{raw}`: {err}")))?,
                )
            }
            None => None,
        };

        Ok(Some(SlurmJob {
            job_id,
            name: field(self.name)?.to_owned(),
            job_state: SlurmJobState::parse(field(self.state)?),
            exit_code,
            start_time: optional(self.start),
            end_time: optional(self.end),
            elapsed: optional(self.elapsed),
        }))
    }
}

fn parse_table(source_command: &'static str, stdout: &str) -> Result<Vec<SlurmJob>, SlurmError> {
    let mut lines = stdout.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns = Columns::from_header(source_command, header)?;
    let mut jobs = Vec::new();
    for line in lines {
        if let Some(job) = columns.row(source_command, line)? {
            jobs.push(job);
        }
    }
    Ok(jobs)
}

/// Parses `squeue --format='%i|%j|%T'` output including its header row.
///
/// # Errors
///
/// Returns [`SlurmError::Parse`] for a missing header column or a malformed
/// row.
pub fn parse_squeue_output(stdout: &str) -> Result<Vec<SlurmJob>, SlurmError> {
    parse_table("squeue", stdout)
}

/// Parses `sacct --parsable2` output including its header row. Job steps
/// are skipped.
///
/// # Errors
///
/// Returns [`SlurmError::Parse`] for a missing header column or a malformed
/// row.
pub fn parse_sacct_output(stdout: &str) -> Result<Vec<SlurmJob>, SlurmError> {
    parse_table("sacct", stdout)
}
