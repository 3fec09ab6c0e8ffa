// Local crates
use crate::helpers::session_id::SessionId;

// External crates
use std::fmt;
use std::time::Duration;

/// Lifecycle of the collector connection, as seen by the delivery core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Joined,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Joined => "joined",
        };
        f.write_str(name)
    }
}

/// Facts fed into the [`ConnectionSession`](super::session::ConnectionSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// The transport started a connection attempt.
    ConnectStarted,
    /// A handshake failed, the transport backs off and retries.
    ConnectFailed,
    /// A handshake succeeded. `connection_id` identifies this connection so
    /// that a join is never issued twice on it.
    Connected { connection_id: u64 },
    /// The server confirmed the join.
    JoinAcknowledged,
    /// The post-join settle delay ran out.
    SettleElapsed,
    /// The connection dropped, whatever the reason.
    Disconnected,
    /// Local shutdown, nothing reconnects afterwards.
    Shutdown,
}

/// Side effects the controller performs on behalf of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Ask the transport to send a join for this connection.
    SendJoin {
        connection_id: u64,
        session_id: SessionId,
    },
    /// Start (or restart) the settle timer.
    ArmSettleTimer(Duration),
    CancelSettleTimer,
    /// The session just became `Joined`: deliver whatever is queued.
    Drain,
}
