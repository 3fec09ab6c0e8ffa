// External crates
use tokio::sync::broadcast;
use tracing::instrument;

/// Process wide interrupt broadcaster, built on-top of a broadcast channel
///
/// - Components call `.subscribe()` to get their own receiver.
/// - `.trigger()` (or an OS signal picked up by `.listen_for_signals()`)
/// notifies every receiver at once.
///
/// An interrupt is the only cancellation path of the relay: it skips the
/// end-of-input drain and stops right away.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Creates a new shutdown broadcast channel.
    /// A small buffer size is sufficient since only one message is sent.
    #[instrument(name = "relay_shutdown_channel", target = "helpers::shutdown", level = "trace")]
    pub fn new() -> Self {
        tracing::trace!("Creating new global shutdown channel");
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }

    /// Returns a new receiver handle
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger shutdown, notifying all subscribed receivers
    #[instrument(name = "relay_shutdown_trigger", target = "helpers::shutdown", level = "trace", skip_all)]
    pub fn trigger(&self) {
        tracing::trace!("Shutdown triggered, notifying shutdown channel subscribers");
        let _ = self.tx.send(());
    }

    /// Spawn a task that triggers shutdown on Ctrl+C or SIGTERM.
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Interrupt received, broadcasting shutdown");
            shutdown.trigger();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C stops the relay");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let mut b = shutdown.clone().subscribe();

        shutdown.trigger();
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
