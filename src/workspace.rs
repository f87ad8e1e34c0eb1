//! Job workspaces: one exclusively owned directory per job.
//!
//! ```text
//! <base>/<job_id>/
//!   input/
//!   output/
//!   temp/
//!   receipt.json     (written once, when the job reaches a terminal state)
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::model::JobId;
use crate::receipt::RECEIPT_FILE_NAME;

const SUBDIRS: [&str; 3] = ["input", "output", "temp"];

/// A job's working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace for `job_id` under `base_dir`.
    ///
    /// Fails if the directory already exists, so two jobs can never share one.
    pub async fn provision(base_dir: &Path, job_id: &JobId) -> Result<Self> {
        tokio::fs::create_dir_all(base_dir).await?;
        let dir = base_dir.join(job_id.as_str());
        tokio::fs::create_dir(&dir).await?;

        let workspace = Self { dir };
        for sub in SUBDIRS {
            if let Err(e) = tokio::fs::create_dir(workspace.dir.join(sub)).await {
                workspace.cleanup().await;
                return Err(e.into());
            }
        }

        debug!(job_id = %job_id, dir = %workspace.dir.display(), "workspace created");
        Ok(workspace)
    }

    /// Handle to an existing workspace, e.g. one recorded on a job row.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join("output")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.join("temp")
    }

    pub fn receipt_path(&self) -> PathBuf {
        self.dir.join(RECEIPT_FILE_NAME)
    }

    /// Remove a workspace that never got a job row.
    pub(crate) async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove workspace");
        } else {
            debug!(dir = %self.dir.display(), "workspace cleaned up");
        }
    }
}
