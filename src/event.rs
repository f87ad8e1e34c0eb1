//! Typed events recorded in the event log.
//!
//! Every event is persisted before anyone sees it. Persisting yields an
//! [`EventRowId`], and that id is the only thing the broadcaster accepts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, JobState, LogLevel};

/// Row id of an event that has been durably written to the event log.
///
/// Only the event log can construct one, so holding an `EventRowId` is proof
/// that the event was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventRowId(i64);

impl EventRowId {
    pub(crate) fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventRowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Global position in the log. Contiguous, starting at 1.
    pub sequence_number: i64,
    /// Present for job-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Per-job counter for progress and log events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_sequence: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventKind {
    #[serde(rename = "engine.heartbeat")]
    EngineHeartbeat {
        uptime_ms: u64,
        health: EngineHealth,
        active_jobs: i64,
        queue_depth: i64,
    },
    #[serde(rename = "engine.shutting_down")]
    EngineShuttingDown {
        reason: String,
        grace_period_ms: u64,
    },
    #[serde(rename = "job.state_changed")]
    JobStateChanged {
        old_state: Option<JobState>,
        new_state: JobState,
    },
    #[serde(rename = "job.progress")]
    JobProgress {
        phase: String,
        progress_percent: Option<u8>,
        items_completed: Option<u64>,
        items_total: Option<u64>,
        eta_seconds: Option<u64>,
    },
    #[serde(rename = "job.log")]
    JobLog {
        level: LogLevel,
        subsystem: String,
        message: String,
        payload: Option<serde_json::Value>,
        correlation_id: Option<String>,
    },
    #[serde(rename = "job.queue_heartbeat")]
    JobQueueHeartbeat {
        queue_position: i64,
        estimated_wait_seconds: Option<u64>,
        claim_attempts: i64,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::EngineHeartbeat { .. } => "engine.heartbeat",
            EventKind::EngineShuttingDown { .. } => "engine.shutting_down",
            EventKind::JobStateChanged { .. } => "job.state_changed",
            EventKind::JobProgress { .. } => "job.progress",
            EventKind::JobLog { .. } => "job.log",
            EventKind::JobQueueHeartbeat { .. } => "job.queue_heartbeat",
        }
    }

    /// Job-scoped events must carry a job id; engine events must not.
    pub fn is_job_scoped(&self) -> bool {
        match self {
            EventKind::EngineHeartbeat { .. } | EventKind::EngineShuttingDown { .. } => false,
            EventKind::JobStateChanged { .. }
            | EventKind::JobProgress { .. }
            | EventKind::JobLog { .. }
            | EventKind::JobQueueHeartbeat { .. } => true,
        }
    }

    /// Whether persisting this event advances the job's own counter.
    pub fn takes_job_sequence(&self) -> bool {
        match self {
            EventKind::JobProgress { .. } | EventKind::JobLog { .. } => true,
            EventKind::EngineHeartbeat { .. }
            | EventKind::EngineShuttingDown { .. }
            | EventKind::JobStateChanged { .. }
            | EventKind::JobQueueHeartbeat { .. } => false,
        }
    }

    /// Log level for indexed retention queries.
    pub fn level(&self) -> Option<LogLevel> {
        match self {
            EventKind::JobLog { level, .. } => Some(*level),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_carries_type_tag_and_flattened_payload() {
        let event = Event {
            sequence_number: 7,
            job_id: Some(JobId::from("job_a")),
            job_sequence: None,
            timestamp: Utc::now(),
            kind: EventKind::JobStateChanged {
                old_state: None,
                new_state: JobState::Queued,
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "job.state_changed");
        assert_eq!(json["sequence_number"], 7);
        assert_eq!(json["new_state"], "queued");
        assert!(json["old_state"].is_null());
        assert!(json.get("job_sequence").is_none());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn engine_events_are_not_job_scoped() {
        let hb = EventKind::EngineHeartbeat {
            uptime_ms: 1,
            health: EngineHealth::Healthy,
            active_jobs: 0,
            queue_depth: 0,
        };
        assert!(!hb.is_job_scoped());
        assert!(!hb.takes_job_sequence());
        assert_eq!(hb.event_type(), "engine.heartbeat");
    }
}
