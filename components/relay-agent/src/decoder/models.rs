// External crates
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// What a line turned out to be once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The line parsed as JSON, the payload is the parsed value.
    Json,
    /// The line is kept verbatim (trimmed) as a string payload.
    Text,
}

impl EventKind {
    /// Wire name of the kind, as sent in `emit` frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Json => "json",
            EventKind::Text => "text",
        }
    }
}

/// A single decoded input line.
///
/// Events are immutable once built: fields are private and only readable
/// through accessors, so the kind always agrees with the payload shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    payload: Value,
    captured_at: DateTime<Utc>,
}

impl Event {
    /// Event wrapping an already parsed JSON value.
    pub fn json(payload: Value, captured_at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::Json,
            payload,
            captured_at,
        }
    }

    /// Event wrapping a raw line of text.
    pub fn text(line: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::Text,
            payload: Value::String(line.into()),
            captured_at,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Wall clock time at which the line was read.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Capture time as unix milliseconds, the resolution used on the wire.
    pub fn timestamp_ms(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }
}
