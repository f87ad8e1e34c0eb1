//! Receipts: the immutable terminal record of a job.
//!
//! A receipt is written exactly once, into the job's workspace, using
//! temp file → fsync → no-clobber rename → chmod 0444. Readers either see no
//! receipt or the complete file; never a partial one. The SHA-256 of the
//! bytes written is stored on the job row for tamper evidence.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, OutputArtifact};
use crate::workspace::Workspace;

pub const RECEIPT_FILE_NAME: &str = "receipt.json";
pub const RECEIPT_SCHEMA_VERSION: &str = "1.0";

/// Outcome recorded in a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptTimestamps {
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: DateTime<Utc>,
}

/// Immutable record of how a job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub schema_version: String,
    pub job_id: JobId,
    /// Correlation id for this run, distinct from the job id.
    pub run_id: String,
    pub receipt_status: ReceiptStatus,
    pub exit_code: Option<String>,
    pub timestamps: ReceiptTimestamps,
    pub config_snapshot: serde_json::Value,
    pub source_pins: BTreeMap<String, String>,
    pub outputs: Vec<OutputArtifact>,
    pub inputs_summary: BTreeMap<String, serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
}

impl Receipt {
    /// Start a receipt for `job`, finishing at `completed_at`.
    pub fn new(
        job: &Job,
        status: ReceiptStatus,
        completed_at: DateTime<Utc>,
        source_pins: BTreeMap<String, String>,
    ) -> Self {
        let mut inputs_summary = BTreeMap::new();
        if let Some(paths) = job.config.get("input_paths") {
            inputs_summary.insert("paths".to_string(), paths.clone());
        }

        Self {
            schema_version: RECEIPT_SCHEMA_VERSION.to_string(),
            job_id: job.job_id.clone(),
            run_id: Uuid::new_v4().simple().to_string(),
            receipt_status: status,
            exit_code: None,
            timestamps: ReceiptTimestamps {
                created: job.created_at,
                started: job.started_at,
                completed: completed_at,
            },
            config_snapshot: job.config.clone(),
            source_pins,
            outputs: Vec::new(),
            inputs_summary,
            error_code: None,
            error_message: None,
            error_details: None,
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputArtifact>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Record the failure. The error code doubles as the exit code.
    pub fn with_error(
        mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        let code = code.into();
        self.exit_code = Some(code.clone());
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.error_details = details;
        self
    }

    /// The exact bytes that go to disk.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// What a successful write left on disk.
#[derive(Debug, Clone)]
pub struct WrittenReceipt {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub json: String,
}

/// Writes receipts atomically and verifies them later.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiptWriter;

impl ReceiptWriter {
    /// Write `receipt` into `workspace`. Refuses to replace an existing receipt.
    pub async fn write(&self, workspace: &Workspace, receipt: &Receipt) -> Result<WrittenReceipt> {
        let bytes = receipt.to_bytes()?;
        let sha256 = sha256_hex(&bytes);
        let dir = workspace.dir().to_path_buf();
        let target = workspace.receipt_path();
        let job_id = receipt.job_id.clone();

        let blocking_target = target.clone();
        let blocking_bytes = bytes.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &blocking_target, &blocking_bytes))
            .await
            .map_err(|e| Error::Other(format!("receipt writer task failed: {e}")))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::ReceiptExists(target.clone()),
                _ => Error::ReceiptWrite {
                    job_id: job_id.clone(),
                    source: e,
                },
            })?;

        debug!(job_id = %job_id, path = %target.display(), sha256 = %sha256, "receipt written");

        Ok(WrittenReceipt {
            path: target,
            sha256,
            size_bytes: bytes.len() as u64,
            json: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// Move a receipt that was never committed to a job row out of the way.
    ///
    /// Such a file is left when the transaction recording it rolls back, or
    /// when the process dies between the write and the commit.
    pub async fn quarantine(&self, workspace: &Workspace) -> Result<PathBuf> {
        let from = workspace.receipt_path();
        let to = workspace.dir().join(format!(
            "receipt.quarantined.{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        ));
        tokio::fs::rename(&from, &to).await?;
        warn!(from = %from.display(), to = %to.display(), "uncommitted receipt quarantined");
        Ok(to)
    }

    /// Re-hash a receipt file and compare it to the stored hash.
    pub async fn verify(&self, path: &Path, expected_sha256: &str) -> Result<bool> {
        let bytes = tokio::fs::read(path).await?;
        Ok(sha256_hex(&bytes) == expected_sha256)
    }
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp = tempfile::Builder::new()
        .prefix(".receipt-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    // A failed persist hands the temp file back; dropping it removes it.
    temp.persist_noclobber(target).map_err(|e| e.error)?;

    set_read_only(target)?;

    if let Err(e) = sync_dir(dir) {
        warn!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
    Ok(())
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
