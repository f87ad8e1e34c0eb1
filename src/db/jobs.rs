//! Job row operations: insert, lookup, guarded state transitions, progress.
//!
//! Functions suffixed `_on` run against an open write transaction so a state
//! change and its event commit together.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::{Error, Result};
use crate::model::*;

const JOB_COLUMNS: &str = "job_id, state, created_at, updated_at, started_at, completed_at,
    config_json, config_hash, workspace_path, idempotency_key,
    progress_percent, progress_phase, items_completed, items_total,
    error_code, error_message, error_details_json, receipt_json, receipt_hash,
    claim_attempts, claimed_at, last_heartbeat_at";

/// Counts of non-terminal jobs, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: i64,
    pub running: i64,
    pub cancelling: i64,
}

impl JobCounts {
    /// Jobs currently owned by an executor.
    pub fn active(&self) -> i64 {
        self.running + self.cancelling
    }
}

/// Fields for a fresh job row.
pub(crate) struct JobInsert<'a> {
    pub job_id: &'a JobId,
    pub config_json: &'a str,
    pub config_hash: &'a str,
    pub workspace_path: &'a str,
    pub idempotency_key: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

impl super::Db {
    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await?;

        row.ok_or_else(|| Error::JobNotFound(id.clone()))?
            .try_into_job()
    }

    /// Find the job created with this idempotency key, if any.
    pub async fn find_job_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = ?1"))
                .bind(key)
                .fetch_optional(self.pool())
                .await?;

        row.map(JobRow::try_into_job).transpose()
    }

    /// List jobs, newest first. An empty `states` slice means all states.
    pub async fn list_jobs(&self, states: &[JobState], limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = if states.is_empty() {
            sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ))
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            let placeholders = (0..states.len())
                .map(|i| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE state IN ({placeholders})
                 ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
                states.len() + 1
            );
            let mut query = sqlx::query_as::<_, JobRow>(&sql);
            for state in states {
                query = query.bind(state.as_str());
            }
            query.bind(limit).fetch_all(self.pool()).await?
        };

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Queued jobs in FIFO order.
    pub async fn queued_jobs(&self) -> Result<Vec<Job>> {
        let mut conn = self.pool().acquire().await?;
        queued_jobs_on(&mut conn).await
    }

    /// The oldest queued job, if any.
    pub async fn next_queued_job_id(&self) -> Result<Option<JobId>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT job_id FROM jobs WHERE state = 'queued' ORDER BY created_at ASC, rowid ASC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(id,)| JobId::from(id)))
    }

    /// Jobs a previous process left running or cancelling.
    pub async fn orphaned_jobs(&self) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state IN ('running', 'cancelling')
             ORDER BY created_at ASC, rowid ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        let mut conn = self.pool().acquire().await?;
        job_counts_on(&mut conn).await
    }
}

pub(crate) async fn queued_jobs_on(conn: &mut SqliteConnection) -> Result<Vec<Job>> {
    let rows: Vec<JobRow> = sqlx::query_as(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'queued' ORDER BY created_at ASC, rowid ASC"
    ))
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(JobRow::try_into_job).collect()
}

pub(crate) async fn job_counts_on(conn: &mut SqliteConnection) -> Result<JobCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM jobs
         WHERE state IN ('queued', 'running', 'cancelling')
         GROUP BY state",
    )
    .fetch_all(conn)
    .await?;

    let mut counts = JobCounts::default();
    for (state, n) in rows {
        match state.as_str() {
            "queued" => counts.queued = n,
            "running" => counts.running = n,
            "cancelling" => counts.cancelling = n,
            _ => {}
        }
    }
    Ok(counts)
}

pub(crate) async fn insert_job_on(conn: &mut SqliteConnection, job: JobInsert<'_>) -> Result<()> {
    sqlx::query(
        "INSERT INTO jobs (
            job_id, state, created_at, updated_at, config_json, config_hash,
            workspace_path, idempotency_key
        ) VALUES (?1, 'queued', ?2, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(job.job_id.as_str())
    .bind(job.created_at)
    .bind(job.config_json)
    .bind(job.config_hash)
    .bind(job.workspace_path)
    .bind(job.idempotency_key)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn get_job_on(conn: &mut SqliteConnection, id: &JobId) -> Result<Job> {
    let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))
        .bind(id.as_str())
        .fetch_optional(conn)
        .await?;

    row.ok_or_else(|| Error::JobNotFound(id.clone()))?
        .try_into_job()
}

pub(crate) async fn find_by_idempotency_key_on(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<Option<Job>> {
    let row: Option<JobRow> =
        sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = ?1"))
            .bind(key)
            .fetch_optional(conn)
            .await?;

    row.map(JobRow::try_into_job).transpose()
}

/// Move a job from `from` to `to`, but only if it is still in `from`.
///
/// Exactly one caller can win a given step. A loser gets
/// `InvalidTransition` carrying the state it actually found.
pub(crate) async fn transition_on(
    conn: &mut SqliteConnection,
    id: &JobId,
    from: JobState,
    to: JobState,
    at: DateTime<Utc>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { from, to });
    }

    let started_at = (to == JobState::Running).then_some(at);
    let completed_at = to.is_terminal().then_some(at);
    let claim_increment = i64::from(to == JobState::Running);

    let rows_affected = sqlx::query(
        "UPDATE jobs SET state = ?1, updated_at = ?2,
            started_at = COALESCE(?3, started_at),
            claimed_at = COALESCE(?3, claimed_at),
            completed_at = COALESCE(?4, completed_at),
            claim_attempts = claim_attempts + ?5
         WHERE job_id = ?6 AND state = ?7",
    )
    .bind(to.as_str())
    .bind(at)
    .bind(started_at)
    .bind(completed_at)
    .bind(claim_increment)
    .bind(id.as_str())
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        let current = get_job_on(conn, id).await?;
        return Err(Error::InvalidTransition {
            from: current.state,
            to,
        });
    }

    Ok(())
}

pub(crate) async fn record_error_on(
    conn: &mut SqliteConnection,
    id: &JobId,
    code: &str,
    message: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let details = details.map(serde_json::to_string).transpose()?;
    sqlx::query(
        "UPDATE jobs SET error_code = ?1, error_message = ?2, error_details_json = ?3
         WHERE job_id = ?4",
    )
    .bind(code)
    .bind(message)
    .bind(details)
    .bind(id.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// Store the latest progress. Fields not reported keep their previous value.
pub(crate) async fn update_progress_on(
    conn: &mut SqliteConnection,
    id: &JobId,
    update: &ProgressUpdate,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET updated_at = ?1, last_heartbeat_at = ?1,
            progress_phase = ?2,
            progress_percent = COALESCE(?3, progress_percent),
            items_completed = COALESCE(?4, items_completed),
            items_total = COALESCE(?5, items_total)
         WHERE job_id = ?6",
    )
    .bind(at)
    .bind(&update.phase)
    .bind(update.percent.map(i64::from))
    .bind(update.items_completed.map(|n| n as i64))
    .bind(update.items_total.map(|n| n as i64))
    .bind(id.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn set_receipt_on(
    conn: &mut SqliteConnection,
    id: &JobId,
    receipt_json: &str,
    receipt_hash: &str,
) -> Result<()> {
    sqlx::query("UPDATE jobs SET receipt_json = ?1, receipt_hash = ?2 WHERE job_id = ?3")
        .bind(receipt_json)
        .bind(receipt_hash)
        .bind(id.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    config_json: String,
    config_hash: String,
    workspace_path: String,
    idempotency_key: Option<String>,
    progress_percent: Option<i64>,
    progress_phase: Option<String>,
    items_completed: Option<i64>,
    items_total: Option<i64>,
    error_code: Option<String>,
    error_message: Option<String>,
    error_details_json: Option<String>,
    receipt_json: Option<String>,
    receipt_hash: Option<String>,
    claim_attempts: i64,
    claimed_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            job_id: JobId::from(self.job_id),
            state: self.state.parse()?,
            config: serde_json::from_str(&self.config_json)?,
            config_hash: self.config_hash,
            idempotency_key: self.idempotency_key,
            workspace_path: PathBuf::from(self.workspace_path),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: Progress {
                percent: self.progress_percent.map(|p| p.clamp(0, 100) as u8),
                phase: self.progress_phase,
                items_completed: self.items_completed.map(|n| n as u64),
                items_total: self.items_total.map(|n| n as u64),
            },
            error_code: self.error_code,
            error_message: self.error_message,
            error_details: self
                .error_details_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            receipt_hash: self.receipt_hash,
            receipt: self
                .receipt_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            claim_attempts: self.claim_attempts,
            claimed_at: self.claimed_at,
            last_heartbeat_at: self.last_heartbeat_at,
        })
    }
}
