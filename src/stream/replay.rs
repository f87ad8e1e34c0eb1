//! Historical reads for (re)connecting subscribers.

use std::sync::Arc;

use crate::db::Db;
use crate::error::Result;
use crate::event::Event;
use crate::model::JobId;

/// Default number of events per replay chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

/// Serves events from the log in bounded chunks.
///
/// Replay is a pure read of the log: the same resume point against the same
/// log state always yields the same events.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    db: Arc<Db>,
    chunk_size: usize,
}

impl ReplayBuffer {
    pub fn new(db: Arc<Db>, chunk_size: usize) -> Self {
        Self {
            db,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Up to one chunk of events after `after_sequence`.
    pub async fn chunk(&self, after_sequence: i64, job_id: Option<&JobId>) -> Result<Vec<Event>> {
        self.db
            .events_since(after_sequence, job_id, Some(self.chunk_size as i64))
            .await
    }

    /// Every event after `after_sequence`, read chunk by chunk.
    pub async fn replay(&self, after_sequence: i64, job_id: Option<&JobId>) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        let mut cursor = after_sequence;
        loop {
            let chunk = self.chunk(cursor, job_id).await?;
            let Some(last) = chunk.last() else { break };
            cursor = last.sequence_number;
            let short = chunk.len() < self.chunk_size;
            out.extend(chunk);
            if short {
                break;
            }
        }
        Ok(out)
    }
}
