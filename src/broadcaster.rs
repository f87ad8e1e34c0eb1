//! Live fan-out of persisted events.
//!
//! [`Broadcaster::broadcast`] takes an [`EventRowId`], never an event value:
//! the only way to get one is to persist an event first. The event is loaded
//! back from the log and pushed to every matching subscriber's bounded queue.
//!
//! Callers broadcast while still holding the writer lock, so every queue
//! receives events in sequence order.
//!
//! Overflow policy is disconnect-and-require-replay. A subscriber whose queue
//! is full is dropped from the registry and flagged; its stream reports the
//! last sequence it received so the client can reconnect and replay from the
//! log. Delivery to everyone else is unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::event::{Event, EventRowId};
use crate::model::JobId;
use crate::telemetry::metrics;

/// Default per-subscriber queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

struct Slot {
    filter: Option<JobId>,
    tx: mpsc::Sender<Event>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Highest sequence number broadcast so far.
    last_sequence: i64,
    slots: HashMap<SubscriberId, Slot>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

/// Fans persisted events out to live subscribers.
pub struct Broadcaster {
    db: Arc<Db>,
    capacity: usize,
    registry: SharedRegistry,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Broadcaster {
    pub fn new(db: Arc<Db>, capacity: usize) -> Self {
        Self {
            db,
            capacity: capacity.max(1),
            registry: Arc::default(),
        }
    }

    /// Start counting from `sequence`, the log position at startup.
    pub fn starting_at(self, sequence: i64) -> Self {
        lock(&self.registry).last_sequence = sequence;
        self
    }

    /// Highest sequence number broadcast so far.
    pub fn last_sequence(&self) -> i64 {
        lock(&self.registry).last_sequence
    }

    /// Register a subscriber with its own bounded queue.
    ///
    /// With a `job_filter`, only events for that job are delivered.
    pub fn add_subscriber(&self, job_filter: Option<JobId>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = SubscriberId(registry.next_id);
        let start_sequence = registry.last_sequence;
        registry.slots.insert(
            id,
            Slot {
                filter: job_filter.clone(),
                tx,
                overflowed: overflowed.clone(),
            },
        );
        drop(registry);

        debug!(subscriber = %id, job_filter = ?job_filter, "subscriber added");

        Subscription {
            id,
            rx,
            overflowed,
            start_sequence,
            last_sequence: 0,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Unregister a subscriber. Dropping the [`Subscription`] does the same.
    pub fn remove_subscriber(&self, id: SubscriberId) {
        if lock(&self.registry).slots.remove(&id).is_some() {
            debug!(subscriber = %id, "subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).slots.len()
    }

    /// Deliver a persisted event to every matching subscriber.
    ///
    /// Returns the number of queues the event was placed on. Fails with
    /// [`Error::EventNotPersisted`] if the row does not exist.
    pub async fn broadcast(&self, id: EventRowId) -> Result<usize> {
        let event = self
            .db
            .event_by_id(id)
            .await?
            .ok_or(Error::EventNotPersisted(id))?;

        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let mut registry = lock(&self.registry);
            registry.last_sequence = registry.last_sequence.max(event.sequence_number);
            for (sub_id, slot) in &registry.slots {
                if slot
                    .filter
                    .as_ref()
                    .is_some_and(|filter| event.job_id.as_ref() != Some(filter))
                {
                    continue;
                }

                match slot.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slot.overflowed.store(true, Ordering::Release);
                        dropped.push(*sub_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*sub_id),
                }
            }
            for sub_id in &dropped {
                registry.slots.remove(sub_id);
            }
        }

        for sub_id in &dropped {
            warn!(
                subscriber = %sub_id,
                seq = event.sequence_number,
                "subscriber queue full or closed, disconnecting"
            );
        }
        if !dropped.is_empty() {
            metrics::subscribers_dropped().add(dropped.len() as u64, &[]);
        }
        metrics::broadcast_deliveries().add(
            delivered as u64,
            &[KeyValue::new("event_type", event.event_type())],
        );

        Ok(delivered)
    }
}

/// Receiving end of a subscriber queue.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
    start_sequence: i64,
    last_sequence: i64,
    registry: Weak<Mutex<Registry>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("last_sequence", &self.last_sequence)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the subscriber has been removed and its
    /// queue drained.
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await?;
        self.last_sequence = event.sequence_number;
        Some(event)
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Event> {
        let event = self.rx.try_recv().ok()?;
        self.last_sequence = event.sequence_number;
        Some(event)
    }

    /// True if the broadcaster dropped this subscriber for falling behind.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Highest sequence broadcast before this subscriber was registered.
    /// Everything after it is delivered to this queue.
    pub fn start_sequence(&self) -> i64 {
        self.start_sequence
    }

    /// Sequence number of the last event received (0 if none yet).
    pub fn last_sequence(&self) -> i64 {
        self.last_sequence
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).slots.remove(&self.id);
        }
    }
}

// The registry is never held across an await, and no code path panics while
// holding it; recover the guard rather than propagate poisoning.
fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
