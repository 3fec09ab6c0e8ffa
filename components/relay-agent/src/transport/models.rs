// Local crates
use crate::{decoder::models::Event, helpers::session_id::SessionId};

// External crates
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a live connection went away. Every reason leads to a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server sent a close frame.
    ServerClosed { code: u16, reason: String },
    /// Reading or writing the socket failed.
    TransportError(String),
    /// The socket ended without a close frame.
    StreamEnded,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerClosed { code, reason } if reason.is_empty() => {
                write!(f, "closed by server ({code})")
            }
            DisconnectReason::ServerClosed { code, reason } => {
                write!(f, "closed by server ({code}: {reason})")
            }
            DisconnectReason::TransportError(e) => write!(f, "transport error: {e}"),
            DisconnectReason::StreamEnded => f.write_str("connection ended"),
        }
    }
}

/// Advisory `rate_limit_exceeded` details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

/// `quota_reached` details: the server refuses further writes for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub current: u64,
    pub limit: u64,
}

/// Messages the collector pushes to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSignal {
    JoinAcknowledged,
    RateLimited(RateLimit),
    QuotaReached(Quota),
    Error(String),
}

/// Everything the transport reports to the stream controller.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection attempt is starting.
    Connecting { attempt: u64 },
    /// A handshake failed, the next attempt starts after `retry_in`.
    ConnectFailed {
        attempt: u64,
        error: String,
        retry_in: Duration,
    },
    /// A connection is up. Events handed to `outbound` are written in order
    /// once this connection has been joined.
    Connected {
        connection_id: u64,
        attempts: u64,
        outbound: mpsc::Sender<Event>,
    },
    /// The connection dropped. `unsent` holds, in order, the events accepted
    /// on `outbound` that were not written. The next attempt starts after
    /// `retry_in`.
    Disconnected {
        reason: DisconnectReason,
        unsent: Vec<Event>,
        retry_in: Duration,
    },
    Signal(ServerSignal),
    /// After a quota signal the live connection stopped taking events and
    /// threw away `count` events still waiting on `outbound`.
    OutboundDiscarded { count: usize },
    /// The configured attempt limit ran out, the transport has stopped.
    GaveUp { attempts: u64, error: String },
}

/// Requests from the controller to the transport worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Send the join frame. Ignored unless `connection_id` is the live one.
    Join {
        connection_id: u64,
        session_id: SessionId,
    },
}
