//! Job lifecycle span helpers.

use tracing::Span;

use crate::model::{JobId, JobState};

/// Start a span covering one lifecycle operation on a job.
///
/// `job.state` is declared empty and filled in by [`record_state_transition`].
pub fn start_job_span(operation: &'static str, job_id: &JobId) -> Span {
    tracing::info_span!(
        "job.lifecycle",
        "job.operation" = operation,
        "job.id" = %job_id,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on `span` and emit it as an `info` event.
pub fn record_state_transition(span: &Span, from: Option<JobState>, to: JobState) {
    span.record("job.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(
            from = from.map(JobState::as_str).unwrap_or("none"),
            to = to.as_str(),
            "state_transition"
        );
    });
}
