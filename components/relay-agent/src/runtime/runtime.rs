// Local crates
use crate::{
    controller::controller::{StopReason, StreamController},
    helpers::{
        load_config::Config,
        session_id::SessionId,
        shutdown::Shutdown,
        status::StatusReporter,
    },
    input::reader::spawn_line_reader,
    metrics::metrics::RelayMetrics,
    transport::transport::{Endpoint, TransportHandle, resolve_endpoint},
};

// External crates
use anyhow::{Context, Result};
use tokio::io::BufReader;
use tracing::instrument;

/// Lines decoded ahead of the controller before the reader waits.
const INPUT_CHANNEL_CAPACITY: usize = 1024;

/// Relay runtime initialization and setup.
///
/// Returns once standard input has ended and delivery settled, or once an
/// interrupt arrived. Errors are the unrecoverable cases: invalid settings,
/// a failing input stream, or an exhausted reconnect limit.
#[instrument(
    name = "relay_runtime::run_relay",
    target = "runtime::runtime",
    skip_all,
    level = "debug"
)]
pub async fn run_relay(cfg: Config) -> Result<StopReason> {
    let status = StatusReporter::new(cfg.general.quiet);

    let session_id = SessionId::normalize(cfg.general.session_id.as_deref())
        .context("Invalid session id")?;
    let url = resolve_endpoint(&cfg.general.server_url)
        .with_context(|| format!("Invalid server url {:?}", cfg.general.server_url))?;
    let endpoint = Endpoint::new(url, cfg.general.auth_token.clone())?;
    let metrics = RelayMetrics::new().context("Failed to register relay metrics")?;

    status.info(format!("streaming to {} as {session_id}", endpoint.url()));
    if let Some(viewer) = &cfg.general.viewer_url {
        status.info(format!(
            "view at {}/{session_id}",
            viewer.trim_end_matches('/')
        ));
    }
    tracing::info!(
        session_id = %session_id,
        endpoint = %endpoint.url(),
        "Starting relay"
    );

    // Initialize global shutdown broadcaster channel
    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();
    let interrupt = shutdown.subscribe();

    let transport = TransportHandle::spawn(cfg.connection.clone(), endpoint);
    let (input, reader) = spawn_line_reader(
        BufReader::new(tokio::io::stdin()),
        INPUT_CHANNEL_CAPACITY,
    );

    let controller = StreamController::new(session_id, &cfg, transport, metrics, status);
    let outcome = controller.run(input, interrupt).await;
    reader.abort();

    let stop = outcome.context("Relay stopped")?;
    match stop {
        StopReason::InputEnded { forfeited: 0 } => status.info("input ended, all events delivered"),
        StopReason::InputEnded { forfeited } => {
            status.info(format!("input ended, {forfeited} events forfeited"))
        }
        StopReason::Interrupted { .. } => status.info("interrupted, stopped"),
    }
    tracing::info!(?stop, "Relay stopped");

    Ok(stop)
}
