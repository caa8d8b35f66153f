//! Remote paths for one workflow submission.

use std::fmt;

/// Slurm log files reported alongside every lifecycle failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogPaths {
    /// Slurm stdout log.
    pub output: String,
    /// Slurm stderr log.
    pub error: String,
}

impl fmt::Display for LogPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stdout log {}, stderr log {}", self.output, self.error)
    }
}

/// Every remote path derived from a submission's unique job name.
///
/// Scripts and logs live under the Slurm log base path as
/// `<job_name>.<ext>`; results go to `<sim_base_path>/<experiment_id>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteLayout {
    /// Unique Slurm job name, also the file prefix.
    pub job_name: String,
    /// Rendered `main.nf`.
    pub nextflow_script: String,
    /// Rendered Nextflow configuration.
    pub nextflow_config: String,
    /// Rendered sbatch wrapper.
    pub sbatch_script: String,
    /// Slurm stdout log.
    pub output_log: String,
    /// Slurm stderr log.
    pub error_log: String,
    /// Nextflow HTML report.
    pub report: String,
    /// Nextflow trace.
    pub trace: String,
    /// Worker event log.
    pub events: String,
    /// Nextflow work directory.
    pub work_dir: String,
    /// Experiment output directory.
    pub output_dir: String,
    /// Rendered workflow configuration inside the output directory.
    pub workflow_config: String,
}

impl RemoteLayout {
    /// Derives the layout for `job_name` and `experiment_id`.
    ///
    /// # Examples
    ///
    /// ```
    /// use slurmflow::nextflow::RemoteLayout;
    ///
    /// let layout = RemoteLayout::new("/hpc/logs/", "/hpc/sims", "sim_0a1b2c3d", "exp1");
    /// assert_eq!(layout.sbatch_script, "/hpc/logs/sim_0a1b2c3d.sbatch");
    /// assert_eq!(layout.workflow_config, "/hpc/sims/exp1/workflow_config.json");
    /// ```
    #[must_use]
    pub fn new(log_base_path: &str, sim_base_path: &str, job_name: &str, experiment_id: &str) -> Self {
        let logs = log_base_path.trim_end_matches('/');
        let prefix = format!("{logs}/{job_name}");
        let output_dir = format!("{}/{experiment_id}", sim_base_path.trim_end_matches('/'));
        Self {
            job_name: job_name.to_owned(),
            nextflow_script: format!("{prefix}.nf"),
            nextflow_config: format!("{prefix}.config"),
            sbatch_script: format!("{prefix}.sbatch"),
            output_log: format!("{prefix}.out"),
            error_log: format!("{prefix}.err"),
            report: format!("{prefix}.report.html"),
            trace: format!("{prefix}.trace.txt"),
            events: format!("{prefix}.events.ndjson"),
            work_dir: format!("{prefix}_work"),
            workflow_config: format!("{output_dir}/workflow_config.json"),
            output_dir,
        }
    }

    /// Log paths carried by lifecycle errors.
    #[must_use]
    pub fn log_paths(&self) -> LogPaths {
        LogPaths {
            output: self.output_log.clone(),
            error: self.error_log.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn layout_uses_job_name_as_prefix() {
        let layout = RemoteLayout::new("/logs", "/sims/", "wf_12345678", "exp-7");
        assert_eq!(layout.nextflow_script, "/logs/wf_12345678.nf");
        assert_eq!(layout.nextflow_config, "/logs/wf_12345678.config");
        assert_eq!(layout.output_log, "/logs/wf_12345678.out");
        assert_eq!(layout.error_log, "/logs/wf_12345678.err");
        assert_eq!(layout.report, "/logs/wf_12345678.report.html");
        assert_eq!(layout.trace, "/logs/wf_12345678.trace.txt");
        assert_eq!(layout.events, "/logs/wf_12345678.events.ndjson");
        assert_eq!(layout.work_dir, "/logs/wf_12345678_work");
        assert_eq!(layout.output_dir, "/sims/exp-7");
    }

    #[rstest]
    fn log_paths_render_both_files() {
        let layout = RemoteLayout::new("/logs", "/sims", "wf", "e");
        assert_eq!(
            layout.log_paths().to_string(),
            "stdout log /logs/wf.out, stderr log /logs/wf.err"
        );
    }
}
