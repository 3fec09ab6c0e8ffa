// External crates
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::fmt;

/// Counters for one relay run.
///
/// Held in a private registry rather than the global one so independent runs
/// (and tests) never share state.
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    /// Events decoded from input.
    pub events_read: IntCounter,
    /// Events handed to the transport.
    pub events_sent: IntCounter,
    /// Events that went through the delivery queue.
    pub events_queued: IntCounter,
    /// Events handed back by a dropped connection and queued again.
    pub events_requeued: IntCounter,
    /// Events evicted or refused by a full bounded queue.
    pub events_dropped: IntCounter,
    /// Events discarded while the server refused writes (quota).
    pub events_discarded: IntCounter,
    /// Events still queued when the relay stopped.
    pub events_forfeited: IntCounter,
    pub reconnects: IntCounter,
    pub queue_depth: IntGauge,
}

impl fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayMetrics")
            .field("events_read", &self.events_read.get())
            .field("events_sent", &self.events_sent.get())
            .field("events_queued", &self.events_queued.get())
            .field("events_forfeited", &self.events_forfeited.get())
            .field("queue_depth", &self.queue_depth.get())
            .finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl RelayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("relay".to_string()), None)?;

        let queue_depth = IntGauge::new("queue_depth", "Events currently waiting in the delivery queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            events_read: counter(&registry, "events_read_total", "Events decoded from input")?,
            events_sent: counter(&registry, "events_sent_total", "Events handed to the transport")?,
            events_queued: counter(
                &registry,
                "events_queued_total",
                "Events that waited in the delivery queue",
            )?,
            events_requeued: counter(
                &registry,
                "events_requeued_total",
                "Events returned unsent by a dropped connection",
            )?,
            events_dropped: counter(
                &registry,
                "events_dropped_total",
                "Events lost to the bounded queue overflow policy",
            )?,
            events_discarded: counter(
                &registry,
                "events_discarded_total",
                "Events discarded while the collector refused writes",
            )?,
            events_forfeited: counter(
                &registry,
                "events_forfeited_total",
                "Events still queued at shutdown",
            )?,
            reconnects: counter(&registry, "reconnects_total", "Successful reconnections")?,
            queue_depth,
            registry,
        })
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode relay metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Log a one line summary of the run.
    pub fn log_summary(&self) {
        tracing::info!(
            read = self.events_read.get(),
            sent = self.events_sent.get(),
            queued = self.events_queued.get(),
            requeued = self.events_requeued.get(),
            dropped = self.events_dropped.get(),
            discarded = self.events_discarded.get(),
            forfeited = self.events_forfeited.get(),
            reconnects = self.reconnects.get(),
            "Relay run summary"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(metrics = %self.render(), "Relay metrics snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn independent_registries() {
        let a = RelayMetrics::new().unwrap();
        let b = RelayMetrics::new().unwrap();
        a.events_sent.inc();
        assert_eq!(a.events_sent.get(), 1);
        assert_eq!(b.events_sent.get(), 0);
    }

    #[test]
    fn renders_prefixed_names() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.events_read.inc_by(3);
        metrics.queue_depth.set(2);

        let text = metrics.render();
        assert!(text.contains("relay_events_read_total 3"));
        assert!(text.contains("relay_queue_depth 2"));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn summary_includes_snapshot_at_debug_level() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.events_sent.inc_by(4);

        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(captured.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || metrics.log_summary());

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Relay run summary"));
        assert!(output.contains("relay_events_sent_total 4"));
    }
}
