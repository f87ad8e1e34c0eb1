//! Error types for engine-spine.
//!
//! Validation errors leave job state untouched. Storage errors abort the
//! operation that triggered them; nothing in memory advances without the
//! matching durable write.

use std::path::PathBuf;

use thiserror::Error;

use crate::event::EventRowId;
use crate::model::{JobId, JobState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("job {job_id} is already {state}")]
    JobTerminal { job_id: JobId, state: JobState },

    #[error("engine is in safe mode; job execution is disabled")]
    SafeMode,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("event {0} has not been persisted")]
    EventNotPersisted(EventRowId),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("failed to write receipt for job {job_id}: {source}")]
    ReceiptWrite {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },

    #[error("receipt already exists: {}", .0.display())]
    ReceiptExists(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors caused by the request itself (unknown job, illegal
    /// transition). These are rejected before any state is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::JobNotFound(_)
                | Error::InvalidTransition { .. }
                | Error::JobTerminal { .. }
                | Error::SafeMode
                | Error::InvalidEvent(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
