// Local crates
use crate::decoder::models::Event;

// External crates
use chrono::{DateTime, Utc};
use tracing::instrument;

/// Decode one input line into an [`Event`], stamped with the current time.
///
/// - Surrounding whitespace (including the line terminator) is stripped.
/// - Empty lines produce no event.
/// - Lines that parse as JSON become `Json` events carrying the parsed value,
/// anything else becomes a `Text` event carrying the trimmed line verbatim.
///
/// Parse failure is a normal branch here, decoding never fails.
#[instrument(
    name = "relay_decoder::decode_line",
    target = "decoder::decoder",
    skip_all,
    level = "trace"
)]
pub fn decode_line(line: &str) -> Option<Event> {
    decode_line_at(line, Utc::now())
}

/// Same as [`decode_line`] with an explicit capture time.
pub fn decode_line_at(line: &str, captured_at: DateTime<Utc>) -> Option<Event> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => {
            tracing::trace!(line_len = trimmed.len(), "Decoded line as JSON");
            Some(Event::json(value, captured_at))
        }
        Err(e) => {
            tracing::trace!(
                line_len = trimmed.len(),
                reason = %e,
                "Line is not JSON, keeping it as text"
            );
            Some(Event::text(trimmed, captured_at))
        }
    }
}

/// Decode a raw byte line, replacing invalid UTF-8 sequences instead of failing.
pub fn decode_bytes(line: &[u8]) -> Option<Event> {
    decode_line(&String::from_utf8_lossy(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::models::EventKind;
    use serde_json::json;

    #[test]
    fn json_line_becomes_json_event() {
        let event = decode_line("{\"cpu\":1}").unwrap();
        assert_eq!(event.kind(), EventKind::Json);
        assert_eq!(event.payload(), &json!({"cpu": 1}));
    }

    #[test]
    fn plain_line_becomes_trimmed_text() {
        let event = decode_line("   hello world \t\n").unwrap();
        assert_eq!(event.kind(), EventKind::Text);
        assert_eq!(event.payload(), &json!("hello world"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(decode_line("").is_none());
        assert!(decode_line("   \r\n").is_none());
    }

    #[test]
    fn broken_json_falls_back_to_text() {
        let event = decode_line("{\"cpu\": ").unwrap();
        assert_eq!(event.kind(), EventKind::Text);
        assert_eq!(event.payload(), &json!("{\"cpu\": "));
    }

    #[test]
    fn json_scalars_are_json() {
        assert_eq!(decode_line("42").unwrap().kind(), EventKind::Json);
        assert_eq!(decode_line("\"quoted\"").unwrap().payload(), &json!("quoted"));
        assert_eq!(decode_line("null").unwrap().payload(), &json!(null));
    }

    #[test]
    fn capture_time_is_kept() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let event = decode_line_at("x", at).unwrap();
        assert_eq!(event.timestamp_ms(), 1_700_000_000_123);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let event = decode_bytes(b"caf\xff\n").unwrap();
        assert_eq!(event.kind(), EventKind::Text);
        assert_eq!(event.payload(), &json!("caf\u{fffd}"));
    }
}
