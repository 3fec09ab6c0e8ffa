//! Transport - responsibility and behavior
//!
//! The transport owns the WebSocket to the collector and nothing else. It
//! does not buffer beyond a small per-connection handoff channel and it does
//! not decide when to join or what to send: the stream controller does.
//!
//! Key responsibilities:
//! - Connect with exponential backoff + jitter, retrying forever unless an
//! attempt limit is configured.
//! - Write the join frame when told to, then the events handed over on the
//! per-connection `outbound` channel, in order.
//! - Turn inbound frames into [`ServerSignal`]s.
//! - On a drop, hand back the events accepted but never written so the
//! controller can queue them again, then reconnect after the backoff delay.
//!
//! Every connection gets a fresh `outbound` channel. Closing the old
//! receiver before draining it means a sender that still points at a dead
//! connection fails fast instead of feeding the next one ahead of its join.

// Local crates
use crate::{
    decoder::models::Event,
    helpers::{load_config::ConnectionConfig, session_id::SessionId},
    transport::{
        models::{DisconnectReason, ServerSignal, TransportCommand, TransportEvent},
        protocol::{decode_signal, encode_emit, encode_join},
    },
};

// External crates
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// A connection that stayed up this long resets the reconnect backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(5);

/// Transport error handling
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported url scheme {0:?}, expected ws, wss, http or https")]
    UnsupportedScheme(String),
    #[error("auth token is not a valid header value")]
    InvalidToken,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Resolve the configured server address into a WebSocket URL.
///
/// `http` and `https` are accepted and mapped to `ws` and `wss`.
pub fn resolve_endpoint(raw: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(raw.trim())?;
    let target = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(TransportError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(target)
        .map_err(|_| TransportError::UnsupportedScheme(url.scheme().to_string()))?;
    Ok(url)
}

/// Handshake target plus optional bearer token.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: Url,
    auth_token: Option<String>,
}

impl Endpoint {
    pub fn new(url: Url, auth_token: Option<String>) -> Result<Self, TransportError> {
        if let Some(token) = &auth_token {
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::InvalidToken)?;
        }
        Ok(Self { url, auth_token })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self) -> Result<Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// Controller side of the transport.
///
/// Created either by [`TransportHandle::spawn`], which runs the socket worker,
/// or by [`TransportHandle::detached`], which hands the worker side to the
/// caller so the transport can be driven by hand.
#[derive(Debug)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
    events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

/// Worker side of a [`TransportHandle::detached`] transport.
#[derive(Debug)]
pub struct TransportPeer {
    pub events: mpsc::Sender<TransportEvent>,
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    pub cancel: CancellationToken,
}

impl TransportHandle {
    /// Start the background worker connecting to `endpoint`.
    #[instrument(
        name = "relay_transport::spawn",
        target = "transport::transport::TransportHandle",
        skip_all,
        level = "debug"
    )]
    pub fn spawn(config: ConnectionConfig, endpoint: Endpoint) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tracing::debug!(endpoint = %endpoint.url(), "Spawning transport worker");
        let worker = tokio::spawn(run_worker(
            config,
            endpoint,
            events_tx,
            commands_rx,
            cancel.clone(),
        ));

        Self {
            commands: commands_tx,
            events: events_rx,
            cancel,
            worker: Some(worker),
        }
    }

    /// Transport without a worker, the caller plays the socket side.
    pub fn detached() -> (Self, TransportPeer) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = Self {
            commands: commands_tx,
            events: events_rx,
            cancel: cancel.clone(),
            worker: None,
        };
        let peer = TransportPeer {
            events: events_tx,
            commands: commands_rx,
            cancel,
        };
        (handle, peer)
    }

    /// Next transport event, `None` once the worker is gone.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn join(&self, connection_id: u64, session_id: SessionId) {
        if self
            .commands
            .send(TransportCommand::Join {
                connection_id,
                session_id,
            })
            .is_err()
        {
            tracing::debug!(connection_id, "Transport worker gone, join not sent");
        }
    }

    /// Stop the worker and wait (bounded) for it to close the socket.
    #[instrument(
        name = "relay_transport::close",
        target = "transport::transport::TransportHandle",
        skip_all,
        level = "debug"
    )]
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if timeout(CLOSE_TIMEOUT * 2, worker).await.is_err() {
                tracing::warn!("Transport worker did not stop in time");
            }
        }
        tracing::debug!("Transport closed");
    }
}

/// Background worker loop (owns the socket).
///
/// High level algorithm:
/// 1. Connect with `connect_with_retry`.
/// 2. Report `Connected` with a fresh outbound channel.
/// 3. Serve the connection until it drops or the worker is cancelled.
/// 4. On a drop, report `Disconnected` with the unsent events and go to 1.
#[instrument(
    name = "relay_transport::run_worker",
    target = "transport::transport",
    skip_all,
    level = "debug"
)]
async fn run_worker(
    config: ConnectionConfig,
    endpoint: Endpoint,
    events: mpsc::Sender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    cancel: CancellationToken,
) {
    let mut connection_id: u64 = 0;
    let mut backoff = Backoff::new(&config);

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Transport cancelled before a connection was established");
                return;
            }
            result = connect_with_retry(&config, &endpoint, &events, &mut backoff) => result,
        };

        let (ws, attempts) = match connected {
            Ok(connected) => connected,
            Err(ConnectFailure::GaveUp { attempts, error }) => {
                tracing::error!(attempts, error = %error, "Giving up on collector connection");
                let _ = events.send(TransportEvent::GaveUp { attempts, error }).await;
                return;
            }
            Err(ConnectFailure::ControllerGone) => return,
        };

        connection_id += 1;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        if events
            .send(TransportEvent::Connected {
                connection_id,
                attempts,
                outbound: outbound_tx,
            })
            .await
            .is_err()
        {
            return;
        }

        let connected_at = Instant::now();
        let outcome = serve_connection(
            ws,
            connection_id,
            outbound_rx,
            &mut commands,
            &events,
            &cancel,
        )
        .await;

        match outcome {
            ConnectionOutcome::Closed => return,
            ConnectionOutcome::Dropped { reason, unsent } => {
                let uptime = connected_at.elapsed();
                if uptime >= STABLE_CONNECTION {
                    backoff.reset();
                }
                let retry_in = backoff.next_wait();
                tracing::warn!(
                    connection_id,
                    reason = %reason,
                    unsent = unsent.len(),
                    uptime = ?uptime,
                    retry_in = ?retry_in,
                    "Collector connection dropped, reconnecting"
                );
                if events
                    .send(TransportEvent::Disconnected {
                        reason,
                        unsent,
                        retry_in,
                    })
                    .await
                    .is_err()
                {
                    return;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(retry_in) => {}
                }
            }
        }
    }
}

enum ConnectFailure {
    GaveUp { attempts: u64, error: String },
    ControllerGone,
}

/// Connect to the collector with exponential backoff + jitter.
///
/// Policy:
/// - Waits come from `backoff`, which outlives a single call: a connection
/// that drops soon after its handshake keeps the delay growing.
/// - Multiply the delay by `backoff_factor` after each wait, capped at
/// `max_retry_delay_ms`.
/// - Randomize each wait by `retry_jitter` (prevents thundering herd).
/// - Respect `max_reconnect_attempts` if set, otherwise retry indefinitely.
/// - Each attempt is bounded by `connection_timeout_ms`.
#[instrument(
    name = "relay_transport::connect_with_retry",
    target = "transport::transport",
    skip_all,
    level = "debug"
)]
async fn connect_with_retry(
    config: &ConnectionConfig,
    endpoint: &Endpoint,
    events: &mpsc::Sender<TransportEvent>,
    backoff: &mut Backoff,
) -> Result<(WsStream, u64), ConnectFailure> {
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        if events
            .send(TransportEvent::Connecting { attempt: attempts })
            .await
            .is_err()
        {
            return Err(ConnectFailure::ControllerGone);
        }

        tracing::debug!(endpoint = %endpoint.url(), attempt = attempts, "Connecting to collector");
        let error = match attempt_handshake(config, endpoint).await {
            Ok(ws) => {
                tracing::info!(endpoint = %endpoint.url(), attempts, "Connected to collector");
                return Ok((ws, attempts));
            }
            Err(e) => e.to_string(),
        };

        if let Some(limit) = config.max_reconnect_attempts {
            if attempts >= limit {
                return Err(ConnectFailure::GaveUp { attempts, error });
            }
        }

        let retry_in = backoff.next_wait();
        tracing::debug!(
            error = %error,
            attempt = attempts,
            retry_in = ?retry_in,
            "Collector handshake failed, backing off"
        );
        if events
            .send(TransportEvent::ConnectFailed {
                attempt: attempts,
                error,
                retry_in,
            })
            .await
            .is_err()
        {
            return Err(ConnectFailure::ControllerGone);
        }

        sleep(retry_in).await;
    }
}

async fn attempt_handshake(
    config: &ConnectionConfig,
    endpoint: &Endpoint,
) -> Result<WsStream, TransportError> {
    let request = endpoint.request()?;
    match timeout(config.connection_timeout(), connect_async(request)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::Handshake(e.to_string())),
        Err(_) => Err(TransportError::Handshake(format!(
            "timed out after {:?}",
            config.connection_timeout()
        ))),
    }
}

/// Reconnect delay shared by failed handshakes and dropped connections.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    fn new(config: &ConnectionConfig) -> Self {
        let initial = Duration::from_millis(config.initial_retry_delay_ms);
        Self {
            initial,
            current: initial,
            max: Duration::from_millis(config.max_retry_delay_ms),
            factor: config.backoff_factor,
            jitter: config.retry_jitter,
        }
    }

    /// Jittered wait before the next attempt. Each call grows the base delay.
    fn next_wait(&mut self) -> Duration {
        let wait = jittered(self.current, self.jitter);
        self.current = next_delay(self.current, self.factor, self.max);
        wait
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Scale `delay` by a random factor in `[1 - jitter, 1 + jitter)`.
fn jittered(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return delay;
    }
    let factor: f64 = rand::rng().random_range(1.0 - jitter..1.0 + jitter);
    delay.mul_f64(factor)
}

fn next_delay(delay: Duration, factor: f64, max: Duration) -> Duration {
    delay.mul_f64(factor.max(1.0)).min(max)
}

enum ConnectionOutcome {
    /// Worker cancelled, socket closed on purpose.
    Closed,
    Dropped {
        reason: DisconnectReason,
        unsent: Vec<Event>,
    },
}

/// Serve one live connection.
///
/// Outbound events are only read after the join frame for this connection
/// went out, so nothing can reach the collector ahead of its join. Inbound
/// frames win over outbound events, so a quota signal is acted on before
/// anything else is written.
#[instrument(
    name = "relay_transport::serve_connection",
    target = "transport::transport",
    skip_all,
    fields(connection_id = connection_id),
    level = "debug"
)]
async fn serve_connection(
    ws: WsStream,
    connection_id: u64,
    mut outbound: mpsc::Receiver<Event>,
    commands: &mut mpsc::UnboundedReceiver<TransportCommand>,
    events: &mpsc::Sender<TransportEvent>,
    cancel: &CancellationToken,
) -> ConnectionOutcome {
    let (mut sink, mut stream) = ws.split();
    let mut session_id: Option<SessionId> = None;
    let mut outbound_open = true;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(pending = outbound.len(), "Closing collector connection");
                let _ = timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
                return ConnectionOutcome::Closed;
            }

            command = commands.recv() => {
                let Some(command) = command else {
                    return ConnectionOutcome::Closed;
                };
                match command {
                    TransportCommand::Join { connection_id: target, session_id: id }
                        if target == connection_id && session_id.is_none() =>
                    {
                        let frame = match encode_join(id.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to encode join frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::text(frame)).await {
                            return dropped(
                                DisconnectReason::TransportError(e.to_string()),
                                None,
                                outbound,
                            );
                        }
                        tracing::debug!(session_id = %id, "Join sent");
                        session_id = Some(id);
                    }
                    TransportCommand::Join { connection_id: target, .. } => {
                        tracing::debug!(target, "Ignoring join for another connection");
                    }
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let Some(signal) = decode_signal(&text) else {
                            continue;
                        };
                        // the collector refuses further writes on this connection
                        let discarded = if matches!(signal, ServerSignal::QuotaReached(_)) {
                            outbound_open = false;
                            refuse_outbound(&mut outbound)
                        } else {
                            0
                        };
                        if events.send(TransportEvent::Signal(signal)).await.is_err() {
                            return ConnectionOutcome::Closed;
                        }
                        if discarded > 0
                            && events
                                .send(TransportEvent::OutboundDiscarded { count: discarded })
                                .await
                                .is_err()
                        {
                            return ConnectionOutcome::Closed;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(frame) => DisconnectReason::ServerClosed {
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_owned(),
                            },
                            None => DisconnectReason::ServerClosed {
                                code: 1005,
                                reason: String::new(),
                            },
                        };
                        return dropped(reason, None, outbound);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return dropped(
                            DisconnectReason::TransportError(e.to_string()),
                            None,
                            outbound,
                        );
                    }
                    None => return dropped(DisconnectReason::StreamEnded, None, outbound),
                }
            }

            event = outbound.recv(), if session_id.is_some() && outbound_open => {
                let Some(event) = event else {
                    // controller dropped the sender, keep reading until it closes us
                    outbound_open = false;
                    continue;
                };
                let Some(id) = session_id.as_ref() else {
                    continue;
                };
                let frame = match encode_emit(id.as_str(), &event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode event, dropping it");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(frame)).await {
                    return dropped(
                        DisconnectReason::TransportError(e.to_string()),
                        Some(event),
                        outbound,
                    );
                }
            }
        }
    }
}

/// Close the outbound channel and throw away what is still in it.
fn refuse_outbound(outbound: &mut mpsc::Receiver<Event>) -> usize {
    outbound.close();
    let mut discarded = 0;
    while outbound.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        tracing::warn!(discarded, "Collector quota reached, discarding events not yet written");
    }
    discarded
}

/// Close the outbound channel and collect whatever was never written.
fn dropped(
    reason: DisconnectReason,
    in_flight: Option<Event>,
    mut outbound: mpsc::Receiver<Event>,
) -> ConnectionOutcome {
    outbound.close();
    let mut unsent: Vec<Event> = in_flight.into_iter().collect();
    while let Ok(event) = outbound.try_recv() {
        unsent.push(event);
    }
    ConnectionOutcome::Dropped { reason, unsent }
}
