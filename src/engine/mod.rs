//! The engine context: one value owning every component handle.
//!
//! [`Engine::open`] runs crash recovery before it returns, so no caller can
//! reach the job or stream API until recovery is done.

pub mod jobs;
pub mod status;

pub use jobs::{CreateResult, E_ENGINE_CRASH, JobManager};
pub use status::{EngineMode, EngineStatus, HeartbeatHandle, StatusManager};

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::db::Db;
use crate::error::Result;
use crate::model::JobId;
use crate::stream::{EventStream, ReplayBuffer};

pub struct Engine {
    config: Config,
    db: Arc<Db>,
    broadcaster: Arc<Broadcaster>,
    replay: ReplayBuffer,
    jobs: JobManager,
    status: Arc<StatusManager>,
    recovered: Vec<JobId>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("db", &self.db)
            .field("broadcaster", &self.broadcaster)
            .field("recovered", &self.recovered.len())
            .finish()
    }
}

impl Engine {
    /// Connect, migrate, build every component and recover orphaned jobs.
    pub async fn open(config: &Config) -> Result<Self> {
        let db = Arc::new(Db::connect(&config.database_url).await?);
        db.migrate().await?;
        if !db.check_integrity().await? {
            warn!("database integrity check reported problems");
        }

        let safe_mode = Arc::new(AtomicBool::new(config.safe_mode));
        let broadcaster = Arc::new(
            Broadcaster::new(Arc::clone(&db), config.subscriber_queue_capacity)
                .starting_at(db.current_max_sequence().await?),
        );
        let replay = ReplayBuffer::new(Arc::clone(&db), config.replay_chunk_size);
        let jobs = JobManager::new(
            Arc::clone(&db),
            Arc::clone(&broadcaster),
            config.workspace_dir.clone(),
            config.source_pins.clone(),
            Arc::clone(&safe_mode),
        );
        let status = Arc::new(StatusManager::new(
            Arc::clone(&db),
            Arc::clone(&broadcaster),
            safe_mode,
        ));

        let recovered = jobs.recover_orphaned_jobs().await?;
        info!(
            recovered = recovered.len(),
            safe_mode = config.safe_mode,
            "engine ready"
        );

        Ok(Self {
            config: config.clone(),
            db,
            broadcaster,
            replay,
            jobs,
            status,
            recovered,
            heartbeat: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn status(&self) -> &Arc<StatusManager> {
        &self.status
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    /// Jobs failed by the recovery pass in [`Engine::open`].
    pub fn recovered_jobs(&self) -> &[JobId] {
        &self.recovered
    }

    /// Open an event stream.
    ///
    /// With `resume_from`, every event after that sequence is replayed
    /// before live delivery starts. Without it, the stream is live only.
    pub fn attach_stream(&self, resume_from: Option<i64>, job_filter: Option<JobId>) -> EventStream {
        let subscription = self.broadcaster.add_subscriber(job_filter.clone());
        EventStream::new(
            self.replay.clone(),
            subscription,
            resume_from,
            job_filter,
            self.config.heartbeat_interval(),
        )
    }

    /// Start the periodic heartbeat. Does nothing if it is already running.
    pub fn start_heartbeat(&self) {
        let mut slot = self
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(self.status.spawn_heartbeat(self.config.heartbeat_interval()));
        }
    }

    /// Stop the heartbeat and announce shutdown to every subscriber.
    pub async fn shutdown(&self, reason: &str, grace_period: Duration) -> Result<()> {
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.status.emit_shutdown(reason, grace_period).await?;
        Ok(())
    }

    /// Close the database pool.
    pub async fn close(self) {
        self.db.close().await;
    }
}
