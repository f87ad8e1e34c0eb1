//! Server-sent-events framing and reconnect parsing.
//!
//! ```text
//! event: job.progress
//! id: 42
//! data: {"sequence_number":42,...}
//!
//! ```
//! Live and replayed events carry `id:` so a client's `Last-Event-ID` always
//! names the last sequence number it saw. Protocol markers carry no id.

use serde_json::json;
use tracing::warn;

use super::StreamMessage;
use crate::error::Result;
use crate::event::Event;

/// Header a reconnecting client sends with its last seen sequence.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Default client reconnect delay.
pub const DEFAULT_RETRY_MS: u64 = 3_000;

impl StreamMessage {
    /// Render as one or more SSE frames.
    pub fn to_sse_frame(&self) -> Result<String> {
        let frame = match self {
            StreamMessage::ReplayChunk { events, .. } => {
                let mut out = String::new();
                for event in events {
                    out.push_str(&event_frame(event)?);
                }
                out
            }
            StreamMessage::ReplayComplete {
                replayed_count,
                last_sequence,
            } => marker_frame(
                "replay.complete",
                &json!({
                    "replayed_count": replayed_count,
                    "last_sequence": last_sequence,
                    "now_live": true,
                }),
            ),
            StreamMessage::Event(event) => event_frame(event)?,
            StreamMessage::KeepAlive => ": keep-alive\n\n".to_string(),
            StreamMessage::Lagged { resume_from } => {
                marker_frame("stream.lagged", &json!({ "resume_from": resume_from }))
            }
        };
        Ok(frame)
    }
}

fn event_frame(event: &Event) -> Result<String> {
    let data = serde_json::to_string(event)?;
    Ok(format!(
        "event: {}\nid: {}\ndata: {}\n\n",
        event.event_type(),
        event.sequence_number,
        data
    ))
}

fn marker_frame(event_type: &str, data: &serde_json::Value) -> String {
    format!("event: {event_type}\ndata: {data}\n\n")
}

/// `retry:` directive telling the client how long to wait before reconnecting.
pub fn retry_directive(retry_ms: u64) -> String {
    format!("retry: {retry_ms}\n\n")
}

/// Parse a `Last-Event-ID` value. Anything that isn't a non-negative
/// integer is ignored.
pub fn parse_last_event_id(value: Option<&str>) -> Option<i64> {
    let value = value?.trim();
    match value.parse::<i64>() {
        Ok(seq) if seq >= 0 => Some(seq),
        _ => {
            warn!(value, "ignoring invalid Last-Event-ID");
            None
        }
    }
}

/// Pick the resume point from the reconnect header and the query fallback.
///
/// A valid header wins; otherwise the query value is used.
pub fn resolve_resume_point(header: Option<&str>, query: Option<i64>) -> Option<i64> {
    parse_last_event_id(header).or(query.filter(|seq| *seq >= 0))
}
