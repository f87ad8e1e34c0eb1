//! Event streams: gap-free replay from the log, then live delivery.
//!
//! A stream subscribes to the broadcaster before it reads the log, so an
//! event persisted while replay is in progress shows up either in the replay
//! or live. Live events arrive in sequence order; those at or below the last
//! replayed sequence are dropped, which keeps the observed history free of
//! duplicates.

pub mod replay;
pub mod sse;

pub use replay::ReplayBuffer;
pub use sse::{parse_last_event_id, resolve_resume_point, retry_directive};

use std::time::Duration;

use tracing::debug;

use crate::broadcaster::Subscription;
use crate::error::Result;
use crate::event::Event;
use crate::model::JobId;

/// One message on an event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Historical events, in sequence order.
    ReplayChunk { events: Vec<Event>, has_more: bool },
    /// Replay is finished; everything after this is live. Sent exactly once.
    ReplayComplete {
        replayed_count: u64,
        last_sequence: i64,
    },
    /// A live event.
    Event(Event),
    /// Nothing arrived within the keep-alive interval.
    KeepAlive,
    /// The subscriber fell behind and was disconnected. Reconnect with
    /// `resume_from` to replay what was missed. The stream ends after this.
    Lagged { resume_from: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Replaying,
    Live,
    Done,
}

/// A subscriber's view of the event log.
#[derive(Debug)]
pub struct EventStream {
    replay: ReplayBuffer,
    subscription: Subscription,
    job_filter: Option<JobId>,
    resume_from: Option<i64>,
    keepalive: Duration,
    phase: Phase,
    /// Highest sequence number handed to the consumer.
    cursor: i64,
    replayed_count: u64,
}

impl EventStream {
    pub(crate) fn new(
        replay: ReplayBuffer,
        subscription: Subscription,
        resume_from: Option<i64>,
        job_filter: Option<JobId>,
        keepalive: Duration,
    ) -> Self {
        Self {
            replay,
            subscription,
            job_filter,
            resume_from,
            keepalive,
            phase: Phase::Replaying,
            cursor: resume_from.unwrap_or(0),
            replayed_count: 0,
        }
    }

    /// Next message, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Result<Option<StreamMessage>> {
        match self.phase {
            Phase::Replaying => self.next_replay().await.map(Some),
            Phase::Live => Ok(self.next_live().await),
            Phase::Done => Ok(None),
        }
    }

    /// Run replay to completion and return the replayed events.
    ///
    /// Afterwards [`next`](Self::next) yields live messages only.
    pub async fn drain_replay(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        while self.phase == Phase::Replaying {
            if let StreamMessage::ReplayChunk { events: chunk, .. } = self.next_replay().await? {
                events.extend(chunk);
            }
        }
        Ok(events)
    }

    /// Sequence number of the last event handed out.
    pub fn last_sequence(&self) -> i64 {
        self.cursor
    }

    async fn next_replay(&mut self) -> Result<StreamMessage> {
        if self.resume_from.is_none() {
            // Live only: everything broadcast before the subscription was
            // registered counts as seen; everything after is in the queue.
            self.cursor = self.subscription.start_sequence();
            return Ok(self.finish_replay());
        }

        let events = self.replay.chunk(self.cursor, self.job_filter.as_ref()).await?;
        let Some(last) = events.last() else {
            return Ok(self.finish_replay());
        };

        self.cursor = last.sequence_number;
        self.replayed_count += events.len() as u64;
        let has_more = events.len() >= self.replay.chunk_size();
        Ok(StreamMessage::ReplayChunk { events, has_more })
    }

    fn finish_replay(&mut self) -> StreamMessage {
        self.phase = Phase::Live;
        debug!(
            subscriber = %self.subscription.id(),
            replayed = self.replayed_count,
            last_sequence = self.cursor,
            "replay complete, switching to live"
        );
        StreamMessage::ReplayComplete {
            replayed_count: self.replayed_count,
            last_sequence: self.cursor,
        }
    }

    async fn next_live(&mut self) -> Option<StreamMessage> {
        loop {
            match tokio::time::timeout(self.keepalive, self.subscription.recv()).await {
                Err(_) => return Some(StreamMessage::KeepAlive),
                Ok(Some(event)) => {
                    if event.sequence_number <= self.cursor {
                        continue;
                    }
                    self.cursor = event.sequence_number;
                    return Some(StreamMessage::Event(event));
                }
                Ok(None) => {
                    self.phase = Phase::Done;
                    if self.subscription.overflowed() {
                        return Some(StreamMessage::Lagged {
                            resume_from: self.cursor,
                        });
                    }
                    return None;
                }
            }
        }
    }
}
