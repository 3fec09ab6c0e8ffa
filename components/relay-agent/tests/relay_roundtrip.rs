//! End-to-end tests: the real transport and controller against an in-process
//! WebSocket collector.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use relay_agent::controller::controller::{StopReason, StreamController};
use relay_agent::decoder::decoder::decode_line;
use relay_agent::helpers::load_config::Config;
use relay_agent::helpers::session_id::SessionId;
use relay_agent::helpers::shutdown::Shutdown;
use relay_agent::helpers::status::StatusReporter;
use relay_agent::input::reader::spawn_line_reader;
use relay_agent::metrics::metrics::RelayMetrics;
use relay_agent::transport::models::{ServerSignal, TransportEvent};
use relay_agent::transport::transport::{Endpoint, TransportHandle, resolve_endpoint};

const TIMEOUT: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

fn test_config(url: &str) -> Config {
    let mut cfg = Config::default();
    cfg.general.server_url = url.to_string();
    cfg.connection.initial_retry_delay_ms = 20;
    cfg.connection.max_retry_delay_ms = 100;
    cfg.connection.retry_jitter = 0.0;
    cfg.connection.connection_timeout_ms = 2_000;
    cfg.shutdown.poll_interval_ms = 10;
    cfg
}

struct Relay {
    input: DuplexStream,
    shutdown: Shutdown,
    metrics: RelayMetrics,
    run: tokio::task::JoinHandle<Result<StopReason, relay_agent::controller::controller::ControllerError>>,
}

/// Start the relay with a duplex pipe standing in for stdin.
fn start_relay(cfg: Config, token: Option<&str>) -> Relay {
    let url = resolve_endpoint(&cfg.general.server_url).unwrap();
    let endpoint = Endpoint::new(url, token.map(str::to_string)).unwrap();
    let transport = TransportHandle::spawn(cfg.connection.clone(), endpoint);

    let (input, stdin) = tokio::io::duplex(4096);
    let (lines, _reader) = spawn_line_reader(BufReader::new(stdin), 64);

    let shutdown = Shutdown::new();
    let metrics = RelayMetrics::new().unwrap();
    let controller = StreamController::new(
        SessionId::normalize(Some("e2e")).unwrap(),
        &cfg,
        transport,
        metrics.clone(),
        StatusReporter::quiet(),
    );
    let run = tokio::spawn(controller.run(lines, shutdown.subscribe()));

    Relay {
        input,
        shutdown,
        metrics,
        run,
    }
}

/// Next JSON text frame, `None` once the client went away.
async fn next_frame(ws: &mut ServerWs) -> Option<Value> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.ok()?? {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn expect_join(ws: &mut ServerWs) {
    let join = next_frame(ws).await.unwrap();
    assert_eq!(join, json!({"event": "join", "data": {"sessionId": "session_e2e"}}));
    ws.send(Message::text(
        json!({"event": "joined", "data": {"sessionId": "session_e2e"}}).to_string(),
    ))
    .await
    .unwrap();
}

/// `(kind, payload)` of the next emit frame.
async fn next_emit(ws: &mut ServerWs) -> (String, Value) {
    let frame = next_frame(ws).await.unwrap();
    assert_eq!(frame["event"], "emit");
    assert_eq!(frame["data"]["sessionId"], "session_e2e");
    assert!(frame["data"]["timestamp"].as_i64().unwrap() > 0);
    (
        frame["data"]["kind"].as_str().unwrap().to_string(),
        frame["data"]["payload"].clone(),
    )
}

#[tokio::test]
async fn streams_lines_in_order_and_exits_after_draining() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, auth_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| {
            let auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = auth_tx.send(auth);
            Ok::<_, ErrorResponse>(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        expect_join(&mut ws).await;
        let first = next_emit(&mut ws).await;
        let second = next_emit(&mut ws).await;
        // the relay closes the socket once delivery is done
        let after = next_frame(&mut ws).await;
        (first, second, after)
    });

    let mut relay = start_relay(test_config(&format!("http://{addr}/ws")), Some("s3cret"));
    relay.input.write_all(b"{\"cpu\":1}\nhello\n").await.unwrap();
    drop(relay.input);

    let stop = timeout(TIMEOUT, relay.run).await.unwrap().unwrap().unwrap();
    assert_eq!(stop, StopReason::InputEnded { forfeited: 0 });

    let (first, second, after) = timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(first, ("json".to_string(), json!({"cpu": 1})));
    assert_eq!(second, ("text".to_string(), json!("hello")));
    assert!(after.is_none());

    assert_eq!(auth_rx.await.unwrap().as_deref(), Some("Bearer s3cret"));
    assert_eq!(relay.metrics.events_sent.get(), 2);
}

#[tokio::test]
async fn rejoins_after_server_close_and_keeps_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (progress_tx, mut progress) = mpsc::unbounded_channel::<&'static str>();

    let server = tokio::spawn(async move {
        let mut payloads = Vec::new();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        expect_join(&mut ws).await;
        payloads.push(next_emit(&mut ws).await.1);
        ws.close(None).await.unwrap();
        while next_frame(&mut ws).await.is_some() {}
        progress_tx.send("closed").unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        expect_join(&mut ws).await;
        progress_tx.send("rejoined").unwrap();
        payloads.push(next_emit(&mut ws).await.1);
        payloads.push(next_emit(&mut ws).await.1);
        payloads
    });

    let mut relay = start_relay(test_config(&format!("ws://{addr}/ws")), None);
    relay.input.write_all(b"one\n").await.unwrap();
    assert_eq!(timeout(TIMEOUT, progress.recv()).await.unwrap(), Some("closed"));

    relay.input.write_all(b"two\nthree\n").await.unwrap();
    assert_eq!(timeout(TIMEOUT, progress.recv()).await.unwrap(), Some("rejoined"));

    let payloads = timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(payloads, vec![json!("one"), json!("two"), json!("three")]);
    assert_eq!(relay.metrics.reconnects.get(), 1);

    relay.shutdown.trigger();
    let stop = timeout(TIMEOUT, relay.run).await.unwrap().unwrap().unwrap();
    assert!(matches!(stop, StopReason::Interrupted { .. }));
}

#[tokio::test]
async fn gives_up_when_attempt_limit_runs_out() {
    // reserve a port, then free it so nothing listens there
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut cfg = test_config(&format!("ws://{addr}/ws"));
    cfg.connection.max_reconnect_attempts = Some(2);

    let relay = start_relay(cfg, None);
    let result = timeout(TIMEOUT, relay.run).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(relay_agent::controller::controller::ControllerError::TransportGaveUp { attempts: 2, .. })
    ));
}

#[tokio::test]
async fn backs_off_when_server_keeps_closing_right_away() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    let server = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    let _ = ws.close(None).await;
                    while next_frame(&mut ws).await.is_some() {}
                }
            });
        }
    });

    let mut cfg = test_config(&format!("ws://{addr}/ws"));
    cfg.connection.initial_retry_delay_ms = 100;
    cfg.connection.max_retry_delay_ms = 10_000;
    cfg.connection.backoff_factor = 2.0;
    let relay = start_relay(cfg, None);

    // waits of 100, 200 and 400 ms fit in the first second, the next one does not
    tokio::time::sleep(Duration::from_secs(1)).await;
    let connections = accepted.load(Ordering::SeqCst);
    assert!(
        (2..=5).contains(&connections),
        "expected a handful of backed-off connections, got {connections}"
    );

    relay.shutdown.trigger();
    let stop = timeout(TIMEOUT, relay.run).await.unwrap().unwrap().unwrap();
    assert!(matches!(stop, StopReason::Interrupted { .. }));
    server.abort();
}

#[tokio::test]
async fn quota_signal_discards_events_waiting_on_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (go_tx, go_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        go_rx.await.unwrap();
        ws.send(Message::text(
            json!({"event": "quota_reached", "data": {"current": 50, "limit": 50}}).to_string(),
        ))
        .await
        .unwrap();

        // everything the relay writes from here on, until it goes quiet
        let mut frames = Vec::new();
        while let Ok(Some(Ok(message))) = timeout(Duration::from_millis(300), ws.next()).await {
            if let Message::Text(text) = message {
                frames.push(serde_json::from_str::<Value>(text.as_str()).unwrap());
            }
        }
        frames
    });

    let cfg = test_config(&format!("ws://{addr}/ws"));
    let url = resolve_endpoint(&cfg.general.server_url).unwrap();
    let mut transport = TransportHandle::spawn(cfg.connection.clone(), Endpoint::new(url, None).unwrap());

    let (connection_id, outbound) = loop {
        match timeout(TIMEOUT, transport.next_event()).await.unwrap() {
            Some(TransportEvent::Connected {
                connection_id,
                outbound,
                ..
            }) => break (connection_id, outbound),
            Some(_) => continue,
            None => panic!("transport stopped before connecting"),
        }
    };

    // events sit in the channel: nothing is written before the join
    for n in 0..5 {
        outbound.try_send(decode_line(&n.to_string()).unwrap()).unwrap();
    }
    go_tx.send(()).unwrap();

    assert!(matches!(
        timeout(TIMEOUT, transport.next_event()).await.unwrap(),
        Some(TransportEvent::Signal(ServerSignal::QuotaReached(_)))
    ));
    assert!(matches!(
        timeout(TIMEOUT, transport.next_event()).await.unwrap(),
        Some(TransportEvent::OutboundDiscarded { count: 5 })
    ));
    assert!(outbound.try_send(decode_line("late").unwrap()).is_err());

    transport.join(connection_id, SessionId::normalize(Some("e2e")).unwrap());
    let frames = timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(
        frames,
        vec![json!({"event": "join", "data": {"sessionId": "session_e2e"}})]
    );

    transport.close().await;
}
