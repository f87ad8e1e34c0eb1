//! Core data model.
//!
//! A job is an asynchronous unit of work submitted with an opaque config.
//! The engine tracks its lifecycle state; an external executor does the work.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job row as stored by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub state: JobState,

    /// Config snapshot taken at creation. The engine never interprets it.
    pub config: serde_json::Value,
    pub config_hash: String,

    /// Client-supplied idempotency key, unique across all jobs.
    pub idempotency_key: Option<String>,

    /// Workspace directory exclusively owned by this job.
    pub workspace_path: PathBuf,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub progress: Progress,

    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,

    /// SHA-256 of the receipt bytes on disk.
    pub receipt_hash: Option<String>,
    pub receipt: Option<serde_json::Value>,

    pub claim_attempts: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Latest progress reported for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: Option<u8>,
    pub phase: Option<String>,
    pub items_completed: Option<u64>,
    pub items_total: Option<u64>,
}

/// Newtype for job IDs. Format: `job_YYYYMMDD_HHMMSS_xxxxxxxx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("job_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for an executor.
    Queued,
    /// Claimed by an executor.
    Running,
    /// Cancellation requested; the executor is expected to stop.
    Cancelling,
    Cancelled,
    Completed,
    Failed,
    /// Retention stage. No transition into it exists yet.
    Archived,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)       // cancelled before it ever ran
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed) // crash recovery
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Cancelled | JobState::Completed | JobState::Failed | JobState::Archived
        )
    }

    /// Owned by a live executor. Jobs left here by a dead process are orphans.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Running | JobState::Cancelling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Archived => "archived",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "cancelling" => Ok(JobState::Cancelling),
            "cancelled" => Ok(JobState::Cancelled),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "archived" => Ok(JobState::Archived),
            _ => Err(Error::Other(format!("unknown job state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A file produced by a job, as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// An artifact row registered for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub job_id: JobId,
    pub name: String,
    pub path: String,
    pub artifact_type: String,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Log Level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job view
// ---------------------------------------------------------------------------

/// What job submission and lookup hand back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: serde_json::Value,
    pub progress_percent: Option<u8>,
    pub progress_phase: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            state: job.state,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            config: job.config.clone(),
            progress_percent: job.progress.percent,
            progress_phase: job.progress.phase.clone(),
            error_code: job.error_code.clone(),
            error_message: job.error_message.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Builder for submitting a job. The engine's public API for creating work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) config: serde_json::Value,
    pub(crate) idempotency_key: Option<String>,
}

impl NewJob {
    pub fn new(config: serde_json::Value) -> Self {
        Self {
            config,
            idempotency_key: None,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A progress report from the executor.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub(crate) phase: String,
    pub(crate) percent: Option<u8>,
    pub(crate) items_completed: Option<u64>,
    pub(crate) items_total: Option<u64>,
    pub(crate) eta_seconds: Option<u64>,
}

impl ProgressUpdate {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            percent: None,
            items_completed: None,
            items_total: None,
            eta_seconds: None,
        }
    }

    /// Clamped to 100.
    pub fn percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }

    pub fn items(mut self, completed: u64, total: u64) -> Self {
        self.items_completed = Some(completed);
        self.items_total = Some(total);
        self
    }

    pub fn eta_seconds(mut self, eta: u64) -> Self {
        self.eta_seconds = Some(eta);
        self
    }
}

/// A log line from the executor, scoped to one job.
#[derive(Debug, Clone)]
pub struct JobLogEntry {
    pub(crate) level: LogLevel,
    pub(crate) subsystem: String,
    pub(crate) message: String,
    pub(crate) payload: Option<serde_json::Value>,
    pub(crate) correlation_id: Option<String>,
}

impl JobLogEntry {
    pub fn new(level: LogLevel, subsystem: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            subsystem: subsystem.into(),
            message: message.into(),
            payload: None,
            correlation_id: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
