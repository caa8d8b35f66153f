//! Local staging of rendered artifacts before upload.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;
use uuid::Uuid;

use super::error::NextflowJobError;

/// Rendered file contents for one submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RenderedArtifacts {
    /// Nextflow main script.
    pub nextflow_script: String,
    /// Nextflow execution configuration.
    pub nextflow_config: String,
    /// Workflow configuration JSON.
    pub workflow_config: String,
    /// Slurm wrapper.
    pub sbatch: String,
}

/// Rendered artifacts written to a private temporary directory.
///
/// The directory is removed when the value is dropped.
#[derive(Debug)]
pub struct StagedArtifacts {
    parent: Dir,
    name: String,
    root: Utf8PathBuf,
}

impl StagedArtifacts {
    const NEXTFLOW_SCRIPT: &'static str = "main.nf";
    const NEXTFLOW_CONFIG: &'static str = "nextflow.config";
    const WORKFLOW_CONFIG: &'static str = "workflow_config.json";
    const SBATCH: &'static str = "job.sbatch";

    /// Writes `artifacts` under the system temporary directory.
    ///
    /// # Errors
    ///
    /// Returns [`NextflowJobError::Staging`] when the temporary directory is
    /// not UTF-8 or a file cannot be written.
    pub fn stage(artifacts: &RenderedArtifacts) -> Result<Self, NextflowJobError> {
        let temp = std::env::temp_dir();
        let root = Utf8PathBuf::from_path_buf(temp).map_err(|path| NextflowJobError::Staging {
            path: path.display().to_string(),
            message: String::from("temporary directory is not valid UTF-8"),
        })?;
        Self::stage_in(&root, artifacts)
    }

    /// Writes `artifacts` into a fresh directory below `base`.
    ///
    /// # Errors
    ///
    /// Returns [`NextflowJobError::Staging`] naming the path that failed.
    pub fn stage_in(base: &Utf8Path, artifacts: &RenderedArtifacts) -> Result<Self, NextflowJobError> {
        let staging_error = |path: &Utf8Path, err: std::io::Error| NextflowJobError::Staging {
            path: path.to_string(),
            message: err.to_string(),
        };
        let parent =
            Dir::open_ambient_dir(base, ambient_authority()).map_err(|err| staging_error(base, err))?;
        let name = format!("slurmflow-{}", Uuid::new_v4().simple());
        let root = base.join(&name);
        parent
            .create_dir(&name)
            .map_err(|err| staging_error(&root, err))?;
        let staged = Self { parent, name, root };

        let dir = staged
            .parent
            .open_dir(&staged.name)
            .map_err(|err| staging_error(&staged.root, err))?;
        for (file, contents) in [
            (Self::NEXTFLOW_SCRIPT, &artifacts.nextflow_script),
            (Self::NEXTFLOW_CONFIG, &artifacts.nextflow_config),
            (Self::WORKFLOW_CONFIG, &artifacts.workflow_config),
            (Self::SBATCH, &artifacts.sbatch),
        ] {
            dir.write(file, contents)
                .map_err(|err| staging_error(&staged.root.join(file), err))?;
        }
        debug!(dir = %staged.root, "staged workflow artifacts");
        Ok(staged)
    }

    /// Staging directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Local Nextflow script.
    #[must_use]
    pub fn nextflow_script(&self) -> Utf8PathBuf {
        self.root.join(Self::NEXTFLOW_SCRIPT)
    }

    /// Local Nextflow configuration.
    #[must_use]
    pub fn nextflow_config(&self) -> Utf8PathBuf {
        self.root.join(Self::NEXTFLOW_CONFIG)
    }

    /// Local workflow configuration.
    #[must_use]
    pub fn workflow_config(&self) -> Utf8PathBuf {
        self.root.join(Self::WORKFLOW_CONFIG)
    }

    /// Local sbatch script.
    #[must_use]
    pub fn sbatch(&self) -> Utf8PathBuf {
        self.root.join(Self::SBATCH)
    }
}

impl Drop for StagedArtifacts {
    fn drop(&mut self) {
        if let Err(err) = self.parent.remove_dir_all(&self.name) {
            debug!(dir = %self.root, error = %err, "failed to remove staging directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn artifacts() -> RenderedArtifacts {
        RenderedArtifacts {
            nextflow_script: String::from("workflow {}"),
            nextflow_config: String::from("process.executor = 'local'"),
            workflow_config: String::from("{}"),
            sbatch: String::from("#!/bin/bash\nnextflow run x"),
        }
    }

    #[rstest]
    fn staged_files_exist_until_drop(artifacts: RenderedArtifacts) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let base = Utf8Path::from_path(tmp.path()).expect("utf8 tempdir");

        let staged = StagedArtifacts::stage_in(base, &artifacts).expect("stages");
        let root = staged.root().to_path_buf();
        assert_eq!(
            std::fs::read_to_string(staged.sbatch()).expect("sbatch written"),
            artifacts.sbatch
        );
        assert_eq!(
            std::fs::read_to_string(staged.workflow_config()).expect("config written"),
            "{}"
        );
        assert!(staged.nextflow_script().starts_with(base));

        drop(staged);
        assert!(!root.exists());
    }

    #[rstest]
    fn missing_base_is_reported(artifacts: RenderedArtifacts) {
        let err = StagedArtifacts::stage_in(Utf8Path::new("/nonexistent/slurmflow"), &artifacts)
            .expect_err("missing base");
        assert!(matches!(err, NextflowJobError::Staging { ref path, .. } if path == "/nonexistent/slurmflow"));
    }
}
