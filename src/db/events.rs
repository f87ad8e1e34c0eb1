//! The event log: durable, append-only, and the only source of ordering.
//!
//! `sequence_number` comes from a singleton counter row bumped inside the
//! same transaction that inserts the event, so a failed insert never burns a
//! number and concurrent writers can never observe the same value.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventRowId};
use crate::model::JobId;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

impl super::Db {
    /// Persist an event, assigning its global sequence number.
    ///
    /// Either the sequence bump and the row insert both commit, or neither does.
    pub async fn persist_event(&self, job_id: Option<&JobId>, kind: EventKind) -> Result<EventRowId> {
        let mut tx = self.begin_write().await?;
        let (row_id, _) = persist_event_on(tx.conn(), job_id, kind).await?;
        tx.commit().await?;
        Ok(row_id)
    }

    /// Events with `sequence_number > after`, ascending.
    ///
    /// With a `job_id` only that job's events are returned. `limit` caps the
    /// page size for chunked reads.
    pub async fn events_since(
        &self,
        after: i64,
        job_id: Option<&JobId>,
        limit: Option<i64>,
    ) -> Result<Vec<Event>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.unwrap_or(-1);
        let rows: Vec<(String,)> = match job_id {
            Some(job_id) => {
                sqlx::query_as(
                    "SELECT event_json FROM job_events
                     WHERE sequence_number > ?1 AND job_id = ?2
                     ORDER BY sequence_number ASC
                     LIMIT ?3",
                )
                .bind(after)
                .bind(job_id.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT event_json FROM job_events
                     WHERE sequence_number > ?1
                     ORDER BY sequence_number ASC
                     LIMIT ?2",
                )
                .bind(after)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(Error::from))
            .collect()
    }

    /// Look up a persisted event by row id.
    pub async fn event_by_id(&self, id: EventRowId) -> Result<Option<Event>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT event_json FROM job_events WHERE id = ?1")
            .bind(id.get())
            .fetch_optional(self.pool())
            .await?;

        row.map(|(json,)| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    /// Highest sequence number handed out so far (0 for an empty log).
    pub async fn current_max_sequence(&self) -> Result<i64> {
        let (seq,): (i64,) = sqlx::query_as("SELECT last_sequence FROM sequence_state WHERE id = 1")
            .fetch_one(self.pool())
            .await?;
        Ok(seq)
    }

    /// Delete events older than `cutoff`. With `keep_errors`, warn and error
    /// log events survive. Returns the number of rows removed.
    pub async fn delete_events_before(&self, cutoff: DateTime<Utc>, keep_errors: bool) -> Result<u64> {
        let mut tx = self.begin_write().await?;
        let sql = if keep_errors {
            "DELETE FROM job_events
             WHERE timestamp_utc < ?1
             AND (level IS NULL OR level NOT IN ('warn', 'error'))"
        } else {
            "DELETE FROM job_events WHERE timestamp_utc < ?1"
        };
        let deleted = sqlx::query(sql)
            .bind(cutoff)
            .execute(tx.conn())
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}

/// Insert an event inside an open transaction.
///
/// Returns the row id and the event as stored. The caller commits.
pub(crate) async fn persist_event_on(
    conn: &mut SqliteConnection,
    job_id: Option<&JobId>,
    kind: EventKind,
) -> Result<(EventRowId, Event)> {
    match (kind.is_job_scoped(), job_id.is_some()) {
        (true, false) => {
            return Err(Error::InvalidEvent(format!(
                "{} requires a job id",
                kind.event_type()
            )));
        }
        (false, true) => {
            return Err(Error::InvalidEvent(format!(
                "{} is engine-scoped and cannot carry a job id",
                kind.event_type()
            )));
        }
        _ => {}
    }

    let (sequence_number,): (i64,) = sqlx::query_as(
        "UPDATE sequence_state SET last_sequence = last_sequence + 1
         WHERE id = 1
         RETURNING last_sequence",
    )
    .fetch_one(&mut *conn)
    .await?;

    let job_sequence = match job_id {
        Some(job_id) if kind.takes_job_sequence() => {
            let (next,): (i64,) = sqlx::query_as(
                "SELECT COALESCE(MAX(job_sequence), 0) + 1 FROM job_events WHERE job_id = ?1",
            )
            .bind(job_id.as_str())
            .fetch_one(&mut *conn)
            .await?;
            Some(next)
        }
        _ => None,
    };

    let event = Event {
        sequence_number,
        job_id: job_id.cloned(),
        job_sequence,
        timestamp: Utc::now(),
        kind,
    };
    let event_json = serde_json::to_string(&event)?;

    let row_id = sqlx::query(
        "INSERT INTO job_events (
            sequence_number, job_id, job_sequence, timestamp_utc, event_type, level, event_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(sequence_number)
    .bind(event.job_id.as_ref().map(JobId::as_str))
    .bind(job_sequence)
    .bind(event.timestamp)
    .bind(event.event_type())
    .bind(event.kind.level().map(|l| l.as_str()))
    .bind(&event_json)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    debug!(seq = sequence_number, event_type = event.event_type(), "event persisted");
    metrics::events_persisted().add(1, &[KeyValue::new("event_type", event.event_type())]);

    Ok((EventRowId::new(row_id), event))
}
