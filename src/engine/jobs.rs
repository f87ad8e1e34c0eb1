//! Job manager: the job state machine and everything that moves it.
//!
//! Every state change runs inside one serialized write transaction together
//! with its `job.state_changed` event (and, for terminal states, the receipt
//! bookkeeping). The event is broadcast after that transaction commits but
//! before the writer lock is released, so live order is sequence order.
//!
//! ```text
//! queued ──► running ──► completed
//!   │           │    └──► failed
//!   │           ▼
//!   │       cancelling ──► cancelled
//!   └──────────────────────► cancelled
//! ```
//! Crash recovery additionally moves `running`/`cancelling` to `failed`.
//! Cancellation is cooperative: executors poll
//! [`JobManager::is_cancellation_requested`] and stop on their own.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};

use crate::broadcaster::Broadcaster;
use crate::db::{Db, WriteTx};
use crate::db::artifacts::{ArtifactInsert, register_artifact_on};
use crate::db::events::persist_event_on;
use crate::db::jobs::{
    JobInsert, find_by_idempotency_key_on, get_job_on, insert_job_on, record_error_on,
    set_receipt_on, transition_on, update_progress_on,
};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventRowId};
use crate::model::*;
use crate::receipt::{
    RECEIPT_FILE_NAME, Receipt, ReceiptStatus, ReceiptWriter, WrittenReceipt, sha256_hex,
};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;
use crate::workspace::Workspace;

/// The one error code the engine itself assigns.
pub const E_ENGINE_CRASH: &str = "E_ENGINE_CRASH";
const CRASH_MESSAGE: &str = "Engine terminated unexpectedly";

/// Result of a job submission.
#[derive(Debug, Clone)]
pub enum CreateResult {
    /// A new job was created.
    Created(Job),
    /// The idempotency key was already used; this is the original job.
    Existing(Job),
}

impl CreateResult {
    pub fn job(&self) -> &Job {
        match self {
            CreateResult::Created(job) | CreateResult::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            CreateResult::Created(job) | CreateResult::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateResult::Created(_))
    }
}

/// How a job is being finished.
struct Finish {
    from: JobState,
    to: JobState,
    status: ReceiptStatus,
    outputs: Vec<OutputArtifact>,
    error: Option<(String, String, Option<serde_json::Value>)>,
}

pub struct JobManager {
    db: Arc<Db>,
    broadcaster: Arc<Broadcaster>,
    receipts: ReceiptWriter,
    workspace_base: PathBuf,
    source_pins: BTreeMap<String, String>,
    safe_mode: Arc<AtomicBool>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("workspace_base", &self.workspace_base)
            .field("safe_mode", &self.safe_mode.load(Ordering::Relaxed))
            .finish()
    }
}

impl JobManager {
    pub fn new(
        db: Arc<Db>,
        broadcaster: Arc<Broadcaster>,
        workspace_base: impl Into<PathBuf>,
        source_pins: BTreeMap<String, String>,
        safe_mode: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db,
            broadcaster,
            receipts: ReceiptWriter,
            workspace_base: workspace_base.into(),
            source_pins,
            safe_mode,
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Submit a job.
    ///
    /// If the idempotency key was used before, the original job is returned
    /// untouched and the new config is ignored.
    pub async fn create(&self, new: NewJob) -> Result<CreateResult> {
        let start = Instant::now();
        let result = self.create_inner(new).await;

        let label = match &result {
            Ok(CreateResult::Created(_)) => "created",
            Ok(CreateResult::Existing(_)) => "idempotent",
            Err(_) => "error",
        };
        metrics::jobs_submitted().add(1, &[KeyValue::new("result", label)]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "job.create")],
        );
        result
    }

    async fn create_inner(&self, new: NewJob) -> Result<CreateResult> {
        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self.db.find_job_by_idempotency_key(key).await? {
                debug!(job_id = %existing.job_id, idempotency_key = %key, "idempotent resubmission");
                return Ok(CreateResult::Existing(existing));
            }
        }

        let job_id = JobId::generate();
        let config_json = serde_json::to_string(&new.config)?;
        let config_hash = config_hash(&config_json);
        let workspace = Workspace::provision(&self.workspace_base, &job_id).await?;

        let span = start_job_span("create", &job_id);
        let inserted = async {
            let mut tx = self.db.begin_write().await?;

            // A racing submission with the same key may have committed since
            // the unlocked check above.
            if let Some(key) = &new.idempotency_key {
                if let Some(existing) = find_by_idempotency_key_on(tx.conn(), key).await? {
                    return Ok(Err(existing));
                }
            }

            insert_job_on(
                tx.conn(),
                JobInsert {
                    job_id: &job_id,
                    config_json: &config_json,
                    config_hash: &config_hash,
                    workspace_path: &workspace.dir().to_string_lossy(),
                    idempotency_key: new.idempotency_key.as_deref(),
                    created_at: Utc::now(),
                },
            )
            .await?;
            let (row_id, _) = persist_event_on(
                tx.conn(),
                Some(&job_id),
                EventKind::JobStateChanged {
                    old_state: None,
                    new_state: JobState::Queued,
                },
            )
            .await?;
            self.commit_and_publish(tx, row_id).await?;
            Ok::<_, Error>(Ok(()))
        }
        .instrument(span.clone())
        .await;

        match inserted {
            Ok(Ok(())) => {
                record_state_transition(&span, None, JobState::Queued);
                info!(job_id = %job_id, "job created");
                Ok(CreateResult::Created(self.db.get_job(&job_id).await?))
            }
            Ok(Err(existing)) => {
                workspace.cleanup().await;
                Ok(CreateResult::Existing(existing))
            }
            Err(e) => {
                workspace.cleanup().await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: &JobId) -> Result<Job> {
        self.db.get_job(id).await
    }

    pub async fn view(&self, id: &JobId) -> Result<JobView> {
        Ok(JobView::from(&self.db.get_job(id).await?))
    }

    /// Jobs in any of `states` (all if empty), newest first.
    pub async fn list(&self, states: &[JobState], limit: i64) -> Result<Vec<Job>> {
        self.db.list_jobs(states, limit).await
    }

    /// Oldest queued job, for executors looking for work.
    pub async fn next_queued(&self) -> Result<Option<JobId>> {
        self.db.next_queued_job_id().await
    }

    pub async fn artifacts(&self, id: &JobId) -> Result<Vec<Artifact>> {
        self.db.get_job(id).await?;
        self.db.artifacts(id).await
    }

    /// True once cancellation was requested. Executors poll this.
    pub async fn is_cancellation_requested(&self, id: &JobId) -> Result<bool> {
        let job = self.db.get_job(id).await?;
        Ok(matches!(job.state, JobState::Cancelling | JobState::Cancelled))
    }

    /// Re-hash the receipt on disk and compare it with the stored hash.
    ///
    /// `Ok(false)` if the job has no receipt or the file no longer matches.
    pub async fn verify_receipt(&self, id: &JobId) -> Result<bool> {
        let job = self.db.get_job(id).await?;
        let Some(expected) = job.receipt_hash else {
            return Ok(false);
        };
        let path = Workspace::at(&job.workspace_path).receipt_path();
        match self.receipts.verify(&path, &expected).await {
            Ok(matches) => Ok(matches),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Executor operations
    // -----------------------------------------------------------------------

    /// Claim a queued job: queued → running.
    pub async fn claim(&self, id: &JobId) -> Result<Job> {
        if self.safe_mode.load(Ordering::Acquire) {
            return Err(Error::SafeMode);
        }
        self.transition(id, JobState::Queued, JobState::Running, "claim")
            .await?;
        self.db.get_job(id).await
    }

    /// Record progress. Updates the job row and emits `job.progress`.
    pub async fn emit_progress(&self, id: &JobId, update: ProgressUpdate) -> Result<Event> {
        let mut tx = self.db.begin_write().await?;
        ensure_not_terminal(&get_job_on(tx.conn(), id).await?)?;

        update_progress_on(tx.conn(), id, &update, Utc::now()).await?;
        let (row_id, event) = persist_event_on(
            tx.conn(),
            Some(id),
            EventKind::JobProgress {
                phase: update.phase,
                progress_percent: update.percent,
                items_completed: update.items_completed,
                items_total: update.items_total,
                eta_seconds: update.eta_seconds,
            },
        )
        .await?;
        self.commit_and_publish(tx, row_id).await?;
        Ok(event)
    }

    /// Emit a job-scoped log line as `job.log`.
    pub async fn emit_log(&self, id: &JobId, entry: JobLogEntry) -> Result<Event> {
        let mut tx = self.db.begin_write().await?;
        ensure_not_terminal(&get_job_on(tx.conn(), id).await?)?;

        let (row_id, event) = persist_event_on(
            tx.conn(),
            Some(id),
            EventKind::JobLog {
                level: entry.level,
                subsystem: entry.subsystem,
                message: entry.message,
                payload: entry.payload,
                correlation_id: entry.correlation_id,
            },
        )
        .await?;
        self.commit_and_publish(tx, row_id).await?;
        Ok(event)
    }

    /// running → completed, with a completed receipt listing `outputs`.
    pub async fn complete(&self, id: &JobId, outputs: Vec<OutputArtifact>) -> Result<Receipt> {
        self.finish(
            id,
            Finish {
                from: JobState::Running,
                to: JobState::Completed,
                status: ReceiptStatus::Completed,
                outputs,
                error: None,
            },
        )
        .await
    }

    /// running → failed. The code and message are recorded as given.
    pub async fn fail(
        &self,
        id: &JobId,
        code: &str,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> Result<Receipt> {
        self.finish(
            id,
            Finish {
                from: JobState::Running,
                to: JobState::Failed,
                status: ReceiptStatus::Failed,
                outputs: Vec::new(),
                error: Some((code.to_string(), message.to_string(), details)),
            },
        )
        .await
    }

    /// Cancel a job and write its cancelled receipt.
    ///
    /// A queued job goes straight to cancelled. A running job first moves to
    /// cancelling, which is committed and broadcast on its own so executors
    /// see the request, then to cancelled.
    pub async fn cancel(&self, id: &JobId) -> Result<Receipt> {
        let job = self.db.get_job(id).await?;
        let from = match job.state {
            JobState::Queued => JobState::Queued,
            JobState::Running => {
                self.transition(id, JobState::Running, JobState::Cancelling, "cancel")
                    .await?;
                JobState::Cancelling
            }
            JobState::Cancelling => JobState::Cancelling,
            state => {
                return Err(Error::JobTerminal {
                    job_id: id.clone(),
                    state,
                });
            }
        };

        self.finish(
            id,
            Finish {
                from,
                to: JobState::Cancelled,
                status: ReceiptStatus::Cancelled,
                outputs: Vec::new(),
                error: None,
            },
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Crash recovery
    // -----------------------------------------------------------------------

    /// Fail every job a previous process left running or cancelling.
    ///
    /// Run once at startup, before any traffic. Returns the ids of the jobs
    /// it failed. Jobs already terminal are never touched.
    pub async fn recover_orphaned_jobs(&self) -> Result<Vec<JobId>> {
        let orphans = self.db.orphaned_jobs().await?;
        if orphans.is_empty() {
            debug!("no orphaned jobs");
            return Ok(Vec::new());
        }

        let mut recovered = Vec::with_capacity(orphans.len());
        for job in orphans {
            warn!(job_id = %job.job_id, state = %job.state, "recovering orphaned job");
            match self.fail_orphan(&job).await {
                Ok(_) => {
                    metrics::jobs_recovered().add(1, &[]);
                    recovered.push(job.job_id);
                }
                Err(Error::InvalidTransition { from, .. }) => {
                    debug!(job_id = %job.job_id, state = %from, "orphan already resolved");
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "crash recovery failed");
                    return Err(e);
                }
            }
        }

        info!(count = recovered.len(), "orphaned jobs recovered");
        Ok(recovered)
    }

    async fn fail_orphan(&self, job: &Job) -> Result<Receipt> {
        self.finish(
            &job.job_id,
            Finish {
                from: job.state,
                to: JobState::Failed,
                status: ReceiptStatus::Failed,
                outputs: Vec::new(),
                error: Some((
                    E_ENGINE_CRASH.to_string(),
                    CRASH_MESSAGE.to_string(),
                    Some(serde_json::json!({ "recovered_from_state": job.state })),
                )),
            },
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// A non-terminal transition and its event, committed together.
    async fn transition(
        &self,
        id: &JobId,
        from: JobState,
        to: JobState,
        operation: &'static str,
    ) -> Result<()> {
        let span = start_job_span(operation, id);
        async {
            let mut tx = self.db.begin_write().await?;
            transition_on(tx.conn(), id, from, to, Utc::now()).await?;
            let (row_id, _) = persist_event_on(
                tx.conn(),
                Some(id),
                EventKind::JobStateChanged {
                    old_state: Some(from),
                    new_state: to,
                },
            )
            .await?;
            self.commit_and_publish(tx, row_id).await
        }
        .instrument(span.clone())
        .await?;

        record_state_transition(&span, Some(from), to);
        count_transition(from, to);
        Ok(())
    }

    /// A terminal transition: state, error fields, receipt file, receipt
    /// hash, artifact rows and the state-changed event in one transaction.
    ///
    /// The state guard runs first, so a caller that loses the race never
    /// reaches the receipt write. If anything after the write fails, the
    /// transaction rolls back and the receipt is quarantined before the
    /// writer lock is released, so the job can still be finished later.
    async fn finish(&self, id: &JobId, finish: Finish) -> Result<Receipt> {
        let start = Instant::now();
        let span = start_job_span("finish", id);
        let Finish {
            from,
            to,
            status,
            outputs,
            error: failure,
        } = finish;

        let receipt = async {
            let mut tx = self.db.begin_write().await?;
            let job = get_job_on(tx.conn(), id).await?;
            let now = Utc::now();

            transition_on(tx.conn(), id, from, to, now).await?;

            let mut receipt = Receipt::new(&job, status, now, self.source_pins.clone())
                .with_outputs(outputs);
            if let Some((code, message, details)) = failure {
                record_error_on(tx.conn(), id, &code, &message, details.as_ref()).await?;
                receipt = receipt.with_error(code, message, details);
            }

            // A non-terminal row has no committed receipt; a file here was
            // left by a finish that never committed.
            let workspace = Workspace::at(&job.workspace_path);
            if tokio::fs::try_exists(workspace.receipt_path()).await? {
                self.receipts.quarantine(&workspace).await?;
            }

            let written = self.receipts.write(&workspace, &receipt).await?;
            let recorded = record_receipt_on(tx.conn(), id, from, to, &written, &receipt, now).await;

            let (sql_tx, _held) = tx.into_parts();
            let committed = match recorded {
                Ok(row_id) => sql_tx.commit().await.map(|()| row_id).map_err(Error::from),
                Err(e) => {
                    drop(sql_tx);
                    Err(e)
                }
            };
            let row_id = match committed {
                Ok(row_id) => row_id,
                Err(e) => {
                    error!(job_id = %id, error = %e, "terminal transition rolled back after receipt write");
                    if let Err(q) = self.receipts.quarantine(&workspace).await {
                        error!(job_id = %id, error = %q, "could not quarantine uncommitted receipt");
                    }
                    return Err(e);
                }
            };

            self.publish(row_id).await;
            Ok::<_, Error>(receipt)
        }
        .instrument(span.clone())
        .await?;

        record_state_transition(&span, Some(from), to);
        count_transition(from, to);
        metrics::receipts_written().add(1, &[KeyValue::new("status", to.as_str())]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "job.finish")],
        );

        match &receipt.error_code {
            Some(code) => warn!(job_id = %id, state = %to, error_code = %code, "job finished"),
            None => info!(job_id = %id, state = %to, "job finished"),
        }
        Ok(receipt)
    }

    /// Commit `tx` and broadcast `row_id` before the writer lock is released.
    async fn commit_and_publish(&self, tx: WriteTx<'_>, row_id: EventRowId) -> Result<()> {
        let _held = tx.commit_held().await?;
        self.publish(row_id).await;
        Ok(())
    }

    /// Broadcast a committed event. A failure here loses nothing: the event
    /// is in the log and subscribers recover it through replay.
    async fn publish(&self, row_id: EventRowId) {
        if let Err(e) = self.broadcaster.broadcast(row_id).await {
            warn!(row_id = %row_id, error = %e, "broadcast after commit failed");
        }
    }
}

fn ensure_not_terminal(job: &Job) -> Result<()> {
    if job.state.is_terminal() {
        return Err(Error::JobTerminal {
            job_id: job.job_id.clone(),
            state: job.state,
        });
    }
    Ok(())
}

/// Receipt hash, artifact rows and the state-changed event for a terminal
/// transition whose receipt is already on disk.
async fn record_receipt_on(
    conn: &mut SqliteConnection,
    id: &JobId,
    from: JobState,
    to: JobState,
    written: &WrittenReceipt,
    receipt: &Receipt,
    now: DateTime<Utc>,
) -> Result<EventRowId> {
    set_receipt_on(&mut *conn, id, &written.json, &written.sha256).await?;

    register_artifact_on(
        &mut *conn,
        ArtifactInsert {
            job_id: id,
            name: RECEIPT_FILE_NAME,
            path: &written.path.to_string_lossy(),
            artifact_type: "receipt",
            size_bytes: Some(written.size_bytes as i64),
            sha256: Some(&written.sha256),
        },
        now,
    )
    .await?;
    for output in &receipt.outputs {
        let name = std::path::Path::new(&output.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| output.path.clone());
        register_artifact_on(
            &mut *conn,
            ArtifactInsert {
                job_id: id,
                name: &name,
                path: &output.path,
                artifact_type: "output",
                size_bytes: Some(output.size_bytes as i64),
                sha256: Some(&output.sha256),
            },
            now,
        )
        .await?;
    }

    let (row_id, _) = persist_event_on(
        conn,
        Some(id),
        EventKind::JobStateChanged {
            old_state: Some(from),
            new_state: to,
        },
    )
    .await?;
    Ok(row_id)
}

fn count_transition(from: JobState, to: JobState) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

/// First 16 hex chars of the SHA-256 of the serialized config.
pub fn config_hash(config_json: &str) -> String {
    let mut hash = sha256_hex(config_json.as_bytes());
    hash.truncate(16);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_hash_is_sixteen_hex_chars_and_stable() {
        let a = config_hash(r#"{"a":1,"b":2}"#);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, config_hash(r#"{"a":1,"b":2}"#));
        assert_ne!(a, config_hash(r#"{"a":2,"b":1}"#));
    }

    #[test]
    fn create_result_exposes_job() {
        let now = Utc::now();
        let job = Job {
            job_id: JobId::from("job_a"),
            state: JobState::Queued,
            config: serde_json::json!({}),
            config_hash: String::new(),
            idempotency_key: None,
            workspace_path: PathBuf::from("/tmp/job_a"),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            progress: Progress::default(),
            error_code: None,
            error_message: None,
            error_details: None,
            receipt_hash: None,
            receipt: None,
            claim_attempts: 0,
            claimed_at: None,
            last_heartbeat_at: None,
        };
        let created = CreateResult::Created(job.clone());
        assert!(created.is_created());
        assert!(!CreateResult::Existing(job).is_created());
        assert_eq!(created.job().job_id.as_str(), "job_a");
    }
}
