//! Wire format.
//!
//! Every WebSocket text frame carries one JSON object
//! `{"event": <name>, "data": <object>}`.
//!
//! Outbound: `join {sessionId}` and `emit {sessionId, kind, payload, timestamp}`.
//! Inbound: `joined`, `rate_limit_exceeded {limit, remaining, resetAt}`,
//! `quota_reached {current, limit}` and `error {message}`. Unknown inbound
//! events are ignored.

// Local crates
use crate::{
    decoder::models::{Event, EventKind},
    transport::models::{Quota, RateLimit, ServerSignal},
};

// External crates
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Join(JoinData<'a>),
    Emit(EmitData<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinData<'a> {
    session_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmitData<'a> {
    session_id: &'a str,
    kind: EventKind,
    payload: &'a Value,
    timestamp: i64,
}

/// Serialize the `join` frame for a session.
pub fn encode_join(session_id: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundFrame::Join(JoinData { session_id }))
}

/// Serialize the `emit` frame carrying one event.
pub fn encode_emit(session_id: &str, event: &Event) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundFrame::Emit(EmitData {
        session_id,
        kind: event.kind(),
        payload: event.payload(),
        timestamp: event.timestamp_ms(),
    }))
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RateLimitData {
    limit: u64,
    remaining: u64,
    reset_at: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QuotaData {
    current: u64,
    limit: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorData {
    message: String,
}

/// Parse an inbound text frame. `None` for frames the agent does not act on.
pub fn decode_signal(text: &str) -> Option<ServerSignal> {
    let frame: RawFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring malformed frame from collector");
            return None;
        }
    };

    let signal = match frame.event.as_str() {
        "joined" => ServerSignal::JoinAcknowledged,
        "rate_limit_exceeded" => {
            let data: RateLimitData = serde_json::from_value(frame.data).ok()?;
            ServerSignal::RateLimited(RateLimit {
                limit: data.limit,
                remaining: data.remaining,
                reset_at: data.reset_at.and_then(DateTime::from_timestamp_millis),
            })
        }
        "quota_reached" => {
            let data: QuotaData = serde_json::from_value(frame.data).ok()?;
            ServerSignal::QuotaReached(Quota {
                current: data.current,
                limit: data.limit,
            })
        }
        "error" => {
            let data: ErrorData = serde_json::from_value(frame.data).unwrap_or_default();
            ServerSignal::Error(data.message)
        }
        other => {
            tracing::debug!(event = other, "Ignoring unknown collector event");
            return None;
        }
    };
    Some(signal)
}
