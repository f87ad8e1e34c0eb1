//! Engine status, heartbeats and the shutdown notice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broadcaster::Broadcaster;
use crate::db::Db;
use crate::db::events::persist_event_on;
use crate::db::jobs::{job_counts_on, queued_jobs_on};
use crate::error::Result;
use crate::event::{EngineHealth, EventKind, EventRowId};

pub const API_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Normal,
    /// Job execution disabled; everything else works.
    Safe,
}

/// Snapshot of engine state for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub version: String,
    pub api_version: String,
    pub capabilities: Vec<String>,
    pub mode: EngineMode,
    pub health: EngineHealth,
    pub uptime_seconds: u64,
    pub active_jobs: i64,
    pub queue_depth: i64,
    pub subscribers: usize,
    pub current_sequence: i64,
}

pub struct StatusManager {
    db: Arc<Db>,
    broadcaster: Arc<Broadcaster>,
    started: Instant,
    safe_mode: Arc<AtomicBool>,
}

impl std::fmt::Debug for StatusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusManager")
            .field("mode", &self.mode())
            .field("uptime", &self.started.elapsed())
            .finish()
    }
}

impl StatusManager {
    pub fn new(db: Arc<Db>, broadcaster: Arc<Broadcaster>, safe_mode: Arc<AtomicBool>) -> Self {
        Self {
            db,
            broadcaster,
            started: Instant::now(),
            safe_mode,
        }
    }

    pub fn mode(&self) -> EngineMode {
        if self.safe_mode.load(Ordering::Acquire) {
            EngineMode::Safe
        } else {
            EngineMode::Normal
        }
    }

    pub fn set_safe_mode(&self, enabled: bool) {
        let was = self.safe_mode.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(safe_mode = enabled, "engine mode changed");
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = vec![
            "sse_streaming".to_string(),
            "event_replay".to_string(),
            "job_management".to_string(),
            "receipt_generation".to_string(),
        ];
        if self.mode() == EngineMode::Normal {
            caps.push("job_execution".to_string());
        }
        caps
    }

    /// Current status. A failing store reports `degraded` with zero counts.
    pub async fn status(&self) -> EngineStatus {
        let (health, counts, current_sequence) = match self.read_counts().await {
            Ok((counts, seq)) => (EngineHealth::Healthy, counts, seq),
            Err(e) => {
                error!(error = %e, "status query failed");
                (EngineHealth::Degraded, Default::default(), 0)
            }
        };

        EngineStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: API_VERSION.to_string(),
            capabilities: self.capabilities(),
            mode: self.mode(),
            health,
            uptime_seconds: self.uptime().as_secs(),
            active_jobs: counts.active(),
            queue_depth: counts.queued,
            subscribers: self.broadcaster.subscriber_count(),
            current_sequence,
        }
    }

    async fn read_counts(&self) -> Result<(crate::db::jobs::JobCounts, i64)> {
        self.db.health_check().await?;
        let counts = self.db.job_counts().await?;
        let seq = self.db.current_max_sequence().await?;
        Ok((counts, seq))
    }

    /// Persist and broadcast one engine heartbeat, plus a queue heartbeat
    /// for every queued job in FIFO order. Returns the number of events.
    ///
    /// Counts and queue positions are read inside the write transaction, so
    /// they match the log position of the heartbeat.
    pub async fn emit_heartbeat(&self) -> Result<usize> {
        let uptime_ms = self.uptime().as_millis() as u64;

        let mut tx = self.db.begin_write().await?;
        let counts = job_counts_on(tx.conn()).await?;
        let queued = queued_jobs_on(tx.conn()).await?;
        let mut row_ids: Vec<EventRowId> = Vec::with_capacity(queued.len() + 1);
        let (row_id, _) = persist_event_on(
            tx.conn(),
            None,
            EventKind::EngineHeartbeat {
                uptime_ms,
                health: EngineHealth::Healthy,
                active_jobs: counts.active(),
                queue_depth: counts.queued,
            },
        )
        .await?;
        row_ids.push(row_id);

        for (position, job) in queued.iter().enumerate() {
            let (row_id, _) = persist_event_on(
                tx.conn(),
                Some(&job.job_id),
                EventKind::JobQueueHeartbeat {
                    queue_position: position as i64 + 1,
                    estimated_wait_seconds: None,
                    claim_attempts: job.claim_attempts,
                },
            )
            .await?;
            row_ids.push(row_id);
        }
        let _held = tx.commit_held().await?;

        for row_id in &row_ids {
            self.broadcaster.broadcast(*row_id).await?;
        }
        debug!(events = row_ids.len(), "heartbeat emitted");
        Ok(row_ids.len())
    }

    /// Persist and broadcast the shutdown notice.
    pub async fn emit_shutdown(&self, reason: &str, grace_period: Duration) -> Result<EventRowId> {
        let mut tx = self.db.begin_write().await?;
        let (row_id, _) = persist_event_on(
            tx.conn(),
            None,
            EventKind::EngineShuttingDown {
                reason: reason.to_string(),
                grace_period_ms: grace_period.as_millis() as u64,
            },
        )
        .await?;
        let _held = tx.commit_held().await?;
        self.broadcaster.broadcast(row_id).await?;
        info!(reason, "shutdown announced");
        Ok(row_id)
    }

    /// Emit heartbeats every `interval` until the handle is stopped.
    ///
    /// A failed tick is logged and the loop carries on.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> HeartbeatHandle {
        let shutdown = Arc::new(Notify::new());
        let status = Arc::clone(self);
        let stop = Arc::clone(&shutdown);

        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "heartbeat started");
            loop {
                tokio::select! {
                    _ = stop.notified() => {
                        info!("heartbeat stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = status.emit_heartbeat().await {
                            error!(error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        HeartbeatHandle { shutdown, task }
    }
}

/// Running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            error!(error = %e, "heartbeat task ended abnormally");
        }
    }
}
