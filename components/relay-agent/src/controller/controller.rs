//! Stream Controller
//!
//! Single control loop of the relay. It merges three sources in one
//! `tokio::select!`:
//! - decoded input lines from the reader task,
//! - transport events (connection lifecycle, server signals),
//! - timers (join settle delay, rate limit pause, shutdown poll) and
//! transport capacity.
//!
//! All delivery state (the [`ConnectionSession`], the [`DeliveryQueue`],
//! suppression flags) is owned here and only touched between `select!`
//! iterations, so no locking is involved.
//!
//! Ordering: an event is sent straight to the transport only when the session
//! is joined and the queue is empty. As long as anything is queued, new events
//! go behind it, so a drain in progress can never be overtaken.

// Local crates
use crate::{
    decoder::models::Event,
    helpers::{
        load_config::Config,
        session_id::SessionId,
        status::StatusReporter,
    },
    input::reader::InputItem,
    metrics::metrics::RelayMetrics,
    queue::delivery_queue::{DeliveryQueue, EventSink, Overflow},
    session::{
        models::{SessionAction, SessionInput},
        session::ConnectionSession,
    },
    transport::{
        models::{Quota, RateLimit, ServerSignal, TransportEvent},
        transport::TransportHandle,
    },
};

// External crates
use chrono::Utc;
use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior, Sleep, interval, sleep};
use tracing::instrument;

/// Longest delivery pause a rate limit signal can impose.
const MAX_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);

/// Failures that end a relay run with an error.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to read input: {0}")]
    Input(#[from] std::io::Error),
    #[error("gave up connecting to the collector after {attempts} attempts: {error}")]
    TransportGaveUp { attempts: u64, error: String },
    #[error("transport stopped unexpectedly")]
    TransportStopped,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Input ended and delivery finished, or the connection was found dead.
    InputEnded { forfeited: u64 },
    /// An interrupt stopped the relay without draining.
    Interrupted { forfeited: u64 },
}

/// Sink over the live outbound channel that remembers a closed connection.
struct OutboundSink<'a> {
    tx: &'a mpsc::Sender<Event>,
    closed: bool,
}

impl EventSink for OutboundSink<'_> {
    fn offer(&mut self, event: Event) -> Result<(), Event> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => Err(event),
            Err(TrySendError::Closed(event)) => {
                self.closed = true;
                Err(event)
            }
        }
    }
}

#[derive(Debug)]
pub struct StreamController {
    session: ConnectionSession,
    queue: DeliveryQueue,
    transport: TransportHandle,
    /// Channel into the live connection, `None` while there is none.
    outbound: Option<mpsc::Sender<Event>>,
    settle_timer: Option<Pin<Box<Sleep>>>,
    /// Set while a rate limit holds delivery back.
    rate_limit_pause: Option<Pin<Box<Sleep>>>,
    /// Connection a quota signal arrived on. Delivery stays off until a
    /// later connection joins.
    suppressed_on: Option<u64>,
    connection_id: u64,
    last_connection_failure: Option<Instant>,
    poll_interval: Duration,
    connect_grace: Duration,
    metrics: RelayMetrics,
    status: StatusReporter,
}

enum ShutdownCheck {
    Wait,
    Delivered,
    ConnectionDead,
}

impl StreamController {
    pub fn new(
        session_id: SessionId,
        config: &Config,
        transport: TransportHandle,
        metrics: RelayMetrics,
        status: StatusReporter,
    ) -> Self {
        Self {
            session: ConnectionSession::new(session_id, config.connection.join_settle()),
            queue: DeliveryQueue::new(&config.queue),
            transport,
            outbound: None,
            settle_timer: None,
            rate_limit_pause: None,
            suppressed_on: None,
            connection_id: 0,
            last_connection_failure: None,
            poll_interval: config.shutdown.poll_interval(),
            connect_grace: config.shutdown.connect_grace(),
            metrics,
            status,
        }
    }

    /// Run until input ends and delivery settles, or until interrupted.
    #[instrument(
        name = "relay_controller::run",
        target = "controller::controller::StreamController",
        skip_all,
        fields(session_id = %self.session.session_id()),
        level = "debug"
    )]
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<InputItem>,
        mut interrupt: broadcast::Receiver<()>,
    ) -> Result<StopReason, ControllerError> {
        let mut input_open = true;
        let mut input_ended_at: Option<Instant> = None;
        let mut shutdown_poll = interval(self.poll_interval);
        shutdown_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let capacity_wait = self.pending_delivery_channel();

            tokio::select! {
                biased;

                Ok(_) = interrupt.recv() => {
                    return Ok(self.interrupt().await);
                }

                event = self.transport.next_event() => {
                    match event {
                        Some(event) => self.on_transport_event(event)?,
                        None => return Err(ControllerError::TransportStopped),
                    }
                }

                _ = wait_timer(&mut self.settle_timer), if self.settle_timer.is_some() => {
                    self.settle_timer = None;
                    let actions = self.session.handle(SessionInput::SettleElapsed);
                    self.apply(actions);
                }

                _ = wait_timer(&mut self.rate_limit_pause), if self.rate_limit_pause.is_some() => {
                    self.rate_limit_pause = None;
                    self.status.info("rate limit window over, resuming delivery");
                    self.drain();
                }

                ready = wait_capacity(capacity_wait.as_ref()), if capacity_wait.is_some() => {
                    if ready {
                        self.drain();
                    } else {
                        tracing::debug!("Outbound channel closed, waiting for reconnect");
                        self.outbound = None;
                    }
                }

                item = input.recv(), if input_open => {
                    match item {
                        Some(InputItem::Event(event)) => self.offer(event),
                        Some(InputItem::End) | None => {
                            tracing::debug!(queued = self.queue.len(), "Input ended, waiting for delivery");
                            input_open = false;
                            input_ended_at = Some(Instant::now());
                            shutdown_poll.reset();
                        }
                        Some(InputItem::Failed(e)) => {
                            self.close().await;
                            return Err(ControllerError::Input(e));
                        }
                    }
                }

                _ = shutdown_poll.tick(), if !input_open => {
                    let ended_at = input_ended_at.unwrap_or_else(Instant::now);
                    match self.shutdown_check(ended_at) {
                        ShutdownCheck::Wait => {}
                        ShutdownCheck::Delivered => {
                            tracing::debug!("Everything delivered, stopping");
                            self.close().await;
                            return Ok(StopReason::InputEnded { forfeited: 0 });
                        }
                        ShutdownCheck::ConnectionDead => {
                            let forfeited = self.forfeit_queue();
                            self.status.warn(format!(
                                "collector unreachable, {forfeited} queued events were not delivered"
                            ));
                            self.close().await;
                            return Ok(StopReason::InputEnded { forfeited });
                        }
                    }
                }
            }
        }
    }

    /// Send an event right away when possible, queue it otherwise.
    fn offer(&mut self, event: Event) {
        self.metrics.events_read.inc();

        if self.suppressed_on.is_some() {
            self.metrics.events_discarded.inc();
            tracing::trace!("Collector refused writes, discarding event");
            return;
        }

        let attempt = match &self.outbound {
            Some(tx) if self.can_deliver() && self.queue.is_empty() => tx.try_send(event),
            _ => Err(TrySendError::Full(event)),
        };
        let event = match attempt {
            Ok(()) => {
                self.metrics.events_sent.inc();
                return;
            }
            Err(TrySendError::Full(event)) => event,
            Err(TrySendError::Closed(event)) => {
                self.outbound = None;
                event
            }
        };

        self.enqueue(event);
    }

    fn enqueue(&mut self, event: Event) {
        match self.queue.enqueue(event) {
            Overflow::None => self.metrics.events_queued.inc(),
            Overflow::DroppedOldest(_) => {
                self.metrics.events_queued.inc();
                self.note_overflow();
            }
            Overflow::DroppedNewest(_) => self.note_overflow(),
        }
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }

    fn note_overflow(&self) {
        self.metrics.events_dropped.inc();
        let dropped = self.metrics.events_dropped.get();
        // warn on the first drop and then sparingly
        if dropped == 1 || dropped % 1000 == 0 {
            self.status.warn(format!(
                "delivery queue full, {dropped} events dropped so far"
            ));
        }
    }

    fn can_deliver(&self) -> bool {
        self.session.is_joined()
            && self.suppressed_on.is_none()
            && self.rate_limit_pause.is_none()
            && self.outbound.is_some()
    }

    /// Outbound channel to wait on for capacity, when queued events are
    /// blocked only by a saturated transport.
    fn pending_delivery_channel(&self) -> Option<mpsc::Sender<Event>> {
        if self.can_deliver() && !self.queue.is_empty() {
            self.outbound.clone()
        } else {
            None
        }
    }

    /// Forward queued events, in order, while the transport takes them.
    fn drain(&mut self) {
        if !self.can_deliver() || self.queue.is_empty() {
            return;
        }
        let Some(tx) = self.outbound.as_ref() else {
            return;
        };

        let mut sink = OutboundSink { tx, closed: false };
        let forwarded = self.queue.drain_into(&mut sink);
        let closed = sink.closed;

        if forwarded > 0 {
            tracing::debug!(forwarded, remaining = self.queue.len(), "Drained delivery queue");
        }
        self.metrics.events_sent.inc_by(forwarded as u64);
        self.metrics.queue_depth.set(self.queue.len() as i64);
        if closed {
            self.outbound = None;
        }
    }

    fn apply(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::SendJoin {
                    connection_id,
                    session_id,
                } => {
                    tracing::debug!(
                        connection_id,
                        session_id = %session_id,
                        joins = self.session.joins_issued(),
                        "Joining session"
                    );
                    self.transport.join(connection_id, session_id);
                }
                SessionAction::ArmSettleTimer(delay) => {
                    self.settle_timer = Some(Box::pin(sleep(delay)));
                }
                SessionAction::CancelSettleTimer => self.settle_timer = None,
                SessionAction::Drain => {
                    if self
                        .suppressed_on
                        .is_some_and(|id| id != self.connection_id)
                    {
                        self.suppressed_on = None;
                        self.status.info("rejoined session, delivery re-enabled");
                    }
                    self.status.info(format!(
                        "joined {}, {} queued events to deliver",
                        self.session.session_id(),
                        self.queue.len()
                    ));
                    self.drain();
                }
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Result<(), ControllerError> {
        match event {
            TransportEvent::Connecting { attempt } => {
                tracing::debug!(attempt, "Connecting to collector");
                let actions = self.session.handle(SessionInput::ConnectStarted);
                self.apply(actions);
            }

            TransportEvent::ConnectFailed {
                attempt,
                error,
                retry_in,
            } => {
                self.last_connection_failure = Some(Instant::now());
                self.status.warn(format!(
                    "connection attempt {attempt} failed ({error}), retrying in {:.1}s",
                    retry_in.as_secs_f64()
                ));
                let actions = self.session.handle(SessionInput::ConnectFailed);
                self.apply(actions);
            }

            TransportEvent::Connected {
                connection_id,
                attempts,
                outbound,
            } => {
                if connection_id > 1 {
                    self.metrics.reconnects.inc();
                    self.status
                        .info(format!("reconnected after {attempts} attempt(s)"));
                } else {
                    self.status.info("connected to collector");
                }
                self.outbound = Some(outbound);
                self.connection_id = connection_id;
                let actions = self.session.handle(SessionInput::Connected { connection_id });
                self.apply(actions);
            }

            TransportEvent::Disconnected {
                reason,
                unsent,
                retry_in,
            } => {
                tracing::debug!(
                    state = %self.session.state(),
                    unsent = unsent.len(),
                    "Collector connection lost"
                );
                self.outbound = None;
                self.last_connection_failure = Some(Instant::now());

                if !unsent.is_empty() {
                    if self.suppressed_on.is_some() {
                        self.metrics.events_discarded.inc_by(unsent.len() as u64);
                    } else {
                        tracing::debug!(count = unsent.len(), "Requeueing events the connection did not write");
                        self.metrics.events_requeued.inc_by(unsent.len() as u64);
                        self.queue.push_front_all(unsent);
                        self.metrics.queue_depth.set(self.queue.len() as i64);
                    }
                }

                self.status.warn(format!(
                    "disconnected: {reason}, reconnecting in {:.1}s",
                    retry_in.as_secs_f64()
                ));
                let actions = self.session.handle(SessionInput::Disconnected);
                self.apply(actions);
            }

            TransportEvent::Signal(signal) => self.on_signal(signal),

            TransportEvent::OutboundDiscarded { count } => {
                self.metrics.events_discarded.inc_by(count as u64);
                self.status.warn(format!(
                    "{count} events handed to the connection were discarded after the quota signal"
                ));
            }

            TransportEvent::GaveUp { attempts, error } => {
                return Err(ControllerError::TransportGaveUp { attempts, error });
            }
        }
        Ok(())
    }

    fn on_signal(&mut self, signal: ServerSignal) {
        match signal {
            ServerSignal::JoinAcknowledged => {
                let actions = self.session.handle(SessionInput::JoinAcknowledged);
                self.apply(actions);
            }
            ServerSignal::RateLimited(limit) => self.on_rate_limit(limit),
            ServerSignal::QuotaReached(quota) => self.on_quota(quota),
            ServerSignal::Error(message) => {
                self.status.warn(format!("collector error: {message}"));
            }
        }
    }

    fn on_rate_limit(&mut self, limit: RateLimit) {
        self.status.warn(format!(
            "rate limit exceeded ({} of {} remaining)",
            limit.remaining, limit.limit
        ));
        if limit.remaining > 0 {
            return;
        }
        let Some(reset_at) = limit.reset_at else {
            return;
        };

        let wait = (reset_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_RATE_LIMIT_PAUSE);
        if wait.is_zero() {
            return;
        }
        tracing::debug!(pause = ?wait, "Pausing delivery until rate limit resets");
        self.rate_limit_pause = Some(Box::pin(sleep(wait)));
    }

    fn on_quota(&mut self, quota: Quota) {
        let discarded = self.queue.clear() as u64;
        self.metrics.events_discarded.inc_by(discarded);
        self.metrics.queue_depth.set(0);
        self.suppressed_on = Some(self.connection_id);
        // the transport stops taking events on this connection
        self.outbound = None;
        self.status.warn(format!(
            "session quota reached ({}/{}), {discarded} queued events discarded; \
             new input is dropped until the session is rejoined",
            quota.current, quota.limit
        ));
    }

    /// Decide, after input ended, whether to keep waiting.
    fn shutdown_check(&self, input_ended_at: Instant) -> ShutdownCheck {
        let in_flight = self
            .outbound
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);

        if self.queue.is_empty() && in_flight == 0 {
            return ShutdownCheck::Delivered;
        }
        if self.session.is_connected() {
            return ShutdownCheck::Wait;
        }

        let failed_since_end = self
            .last_connection_failure
            .is_some_and(|at| at >= input_ended_at);
        if failed_since_end || input_ended_at.elapsed() >= self.connect_grace {
            ShutdownCheck::ConnectionDead
        } else {
            ShutdownCheck::Wait
        }
    }

    fn forfeit_queue(&mut self) -> u64 {
        let forfeited = self.queue.clear() as u64;
        self.metrics.events_forfeited.inc_by(forfeited);
        self.metrics.queue_depth.set(0);
        forfeited
    }

    async fn interrupt(&mut self) -> StopReason {
        let in_flight = self
            .outbound
            .as_ref()
            .map(|tx| (tx.max_capacity() - tx.capacity()) as u64)
            .unwrap_or(0);
        let forfeited = self.forfeit_queue() + in_flight;
        self.metrics.events_forfeited.inc_by(in_flight);
        if forfeited > 0 {
            self.status
                .warn(format!("interrupted, {forfeited} events were not delivered"));
        }
        self.close().await;
        StopReason::Interrupted { forfeited }
    }

    async fn close(&mut self) {
        let actions = self.session.handle(SessionInput::Shutdown);
        self.apply(actions);
        self.outbound = None;
        self.transport.close().await;
        self.metrics.log_summary();
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

/// Resolve once the channel has room (`true`) or is closed (`false`).
async fn wait_capacity(tx: Option<&mpsc::Sender<Event>>) -> bool {
    match tx {
        Some(tx) => tx.reserve().await.is_ok(),
        None => pending().await,
    }
}
