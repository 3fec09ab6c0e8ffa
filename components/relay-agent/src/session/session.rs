//! Connection Session
//!
//! Owns the single [`ConnectionState`] of the collector connection. Every
//! transition is a pure function of the current state and one
//! [`SessionInput`]; the returned [`SessionAction`]s are carried out by the
//! stream controller. Nothing here does I/O or sleeps.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -(join + settle | ack)-> Joined
//!      ^              |  ^                                            |
//!      |              +--+ (failed handshake, backoff)                |
//!      +--------------------------- drop ----------------------------+
//! ```
//!
//! A join is issued on every `Connected` transition, server side join state
//! is never assumed to survive a disconnect. Every transition into `Joined`
//! yields [`SessionAction::Drain`].

// Local crates
use crate::{
    helpers::session_id::SessionId,
    session::models::{ConnectionState, SessionAction, SessionInput},
};

// External crates
use std::time::Duration;
use tracing::instrument;

#[derive(Debug)]
pub struct ConnectionSession {
    state: ConnectionState,
    session_id: SessionId,
    settle_delay: Duration,
    /// Connection the last join was issued on.
    joined_connection: Option<u64>,
    joins_issued: u64,
    terminated: bool,
}

impl ConnectionSession {
    pub fn new(session_id: SessionId, settle_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session_id,
            settle_delay,
            joined_connection: None,
            joins_issued: 0,
            terminated: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.state == ConnectionState::Joined
    }

    /// `true` while a transport connection is up (joined or not).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Joined
        )
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Number of join requests issued so far, one per connection.
    pub fn joins_issued(&self) -> u64 {
        self.joins_issued
    }

    #[cfg(test)]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Apply one input and return the side effects it calls for.
    #[instrument(
        name = "relay_session::handle",
        target = "session::session::ConnectionSession",
        skip(self),
        fields(state = %self.state),
        level = "trace"
    )]
    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        if self.terminated {
            tracing::trace!("Session terminated, ignoring input");
            return Vec::new();
        }

        let previous = self.state;
        let actions = match input {
            SessionInput::ConnectStarted | SessionInput::ConnectFailed => {
                match self.state {
                    ConnectionState::Disconnected | ConnectionState::Connecting => {
                        self.state = ConnectionState::Connecting;
                    }
                    // a live connection is only left through `Disconnected`
                    ConnectionState::Connected | ConnectionState::Joined => {}
                }
                Vec::new()
            }

            SessionInput::Connected { connection_id } => {
                if self.joined_connection == Some(connection_id) {
                    tracing::debug!(connection_id, "Join already issued on this connection");
                    Vec::new()
                } else {
                    self.state = ConnectionState::Connected;
                    self.joined_connection = Some(connection_id);
                    self.joins_issued += 1;
                    vec![
                        SessionAction::SendJoin {
                            connection_id,
                            session_id: self.session_id.clone(),
                        },
                        SessionAction::ArmSettleTimer(self.settle_delay),
                    ]
                }
            }

            SessionInput::JoinAcknowledged => match self.state {
                ConnectionState::Connected => {
                    self.state = ConnectionState::Joined;
                    vec![SessionAction::CancelSettleTimer, SessionAction::Drain]
                }
                _ => Vec::new(),
            },

            SessionInput::SettleElapsed => match self.state {
                ConnectionState::Connected => {
                    self.state = ConnectionState::Joined;
                    vec![SessionAction::Drain]
                }
                _ => Vec::new(),
            },

            SessionInput::Disconnected => {
                self.state = ConnectionState::Disconnected;
                vec![SessionAction::CancelSettleTimer]
            }

            SessionInput::Shutdown => {
                self.state = ConnectionState::Disconnected;
                self.terminated = true;
                vec![SessionAction::CancelSettleTimer]
            }
        };

        if previous != self.state {
            tracing::debug!(from = %previous, to = %self.state, "Connection state changed");
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTLE: Duration = Duration::from_millis(500);

    fn session() -> ConnectionSession {
        ConnectionSession::new(SessionId::normalize(Some("test")).unwrap(), SETTLE)
    }

    fn join_for(connection_id: u64) -> SessionAction {
        SessionAction::SendJoin {
            connection_id,
            session_id: SessionId::normalize(Some("test")).unwrap(),
        }
    }

    #[test]
    fn starts_disconnected() {
        let s = session();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert!(!s.is_connected());
    }

    #[test]
    fn connect_join_settle_reaches_joined() {
        let mut s = session();
        assert!(s.handle(SessionInput::ConnectStarted).is_empty());
        assert_eq!(s.state(), ConnectionState::Connecting);

        let actions = s.handle(SessionInput::Connected { connection_id: 1 });
        assert_eq!(
            actions,
            vec![join_for(1), SessionAction::ArmSettleTimer(SETTLE)]
        );
        assert_eq!(s.state(), ConnectionState::Connected);
        assert!(!s.is_joined());

        assert_eq!(
            s.handle(SessionInput::SettleElapsed),
            vec![SessionAction::Drain]
        );
        assert!(s.is_joined());
    }

    #[test]
    fn failed_handshake_stays_connecting() {
        let mut s = session();
        s.handle(SessionInput::ConnectStarted);
        s.handle(SessionInput::ConnectFailed);
        s.handle(SessionInput::ConnectStarted);
        assert_eq!(s.state(), ConnectionState::Connecting);
    }

    #[test]
    fn join_ack_short_circuits_settle_delay() {
        let mut s = session();
        s.handle(SessionInput::Connected { connection_id: 1 });
        assert_eq!(
            s.handle(SessionInput::JoinAcknowledged),
            vec![SessionAction::CancelSettleTimer, SessionAction::Drain]
        );
        assert!(s.is_joined());
        // late timer is a no-op
        assert!(s.handle(SessionInput::SettleElapsed).is_empty());
    }

    #[test]
    fn no_drain_before_join() {
        let mut s = session();
        assert!(s.handle(SessionInput::SettleElapsed).is_empty());
        assert!(s.handle(SessionInput::JoinAcknowledged).is_empty());
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn rejoins_on_every_reconnect() {
        let mut s = session();
        s.handle(SessionInput::Connected { connection_id: 1 });
        s.handle(SessionInput::SettleElapsed);

        assert_eq!(
            s.handle(SessionInput::Disconnected),
            vec![SessionAction::CancelSettleTimer]
        );
        assert_eq!(s.state(), ConnectionState::Disconnected);

        s.handle(SessionInput::ConnectStarted);
        let actions = s.handle(SessionInput::Connected { connection_id: 2 });
        assert_eq!(actions[0], join_for(2));
        assert_eq!(s.handle(SessionInput::SettleElapsed), vec![SessionAction::Drain]);
        assert_eq!(s.joins_issued(), 2);
    }

    #[test]
    fn duplicate_connected_does_not_join_twice() {
        let mut s = session();
        s.handle(SessionInput::Connected { connection_id: 7 });
        assert!(s.handle(SessionInput::Connected { connection_id: 7 }).is_empty());
        assert_eq!(s.joins_issued(), 1);
    }

    #[test]
    fn disconnect_while_settling_prevents_join() {
        let mut s = session();
        s.handle(SessionInput::Connected { connection_id: 1 });
        s.handle(SessionInput::Disconnected);
        assert!(s.handle(SessionInput::SettleElapsed).is_empty());
        assert!(!s.is_joined());
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut s = session();
        s.handle(SessionInput::Connected { connection_id: 1 });
        s.handle(SessionInput::Shutdown);
        assert!(s.is_terminated());

        assert!(s.handle(SessionInput::ConnectStarted).is_empty());
        assert!(s.handle(SessionInput::Connected { connection_id: 2 }).is_empty());
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }
}
