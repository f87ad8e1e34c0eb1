//! Metric instrument factories for engine-spine.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter(super::SCOPE)
}

/// Counter: events written to the event log.
/// Labels: `event_type`.
pub fn events_persisted() -> Counter<u64> {
    meter()
        .u64_counter("spine.events.persisted")
        .with_description("Number of events persisted to the event log")
        .build()
}

/// Counter: events placed on subscriber queues.
/// Labels: `event_type`.
pub fn broadcast_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("spine.broadcast.deliveries")
        .with_description("Number of event deliveries to live subscribers")
        .build()
}

/// Counter: subscribers disconnected because their queue was full.
pub fn subscribers_dropped() -> Counter<u64> {
    meter()
        .u64_counter("spine.broadcast.subscribers_dropped")
        .with_description("Subscribers disconnected on queue overflow")
        .build()
}

/// Counter: job submissions.
/// Labels: `result` ("created" | "idempotent" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("spine.jobs.submitted")
        .with_description("Number of job submissions")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("spine.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: receipts written.
/// Labels: `status`.
pub fn receipts_written() -> Counter<u64> {
    meter()
        .u64_counter("spine.receipts.written")
        .with_description("Number of receipts written")
        .build()
}

/// Counter: orphaned jobs failed by crash recovery.
pub fn jobs_recovered() -> Counter<u64> {
    meter()
        .u64_counter("spine.jobs.recovered")
        .with_description("Jobs failed by crash recovery")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("spine.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
