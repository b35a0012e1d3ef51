#![allow(dead_code)] // Test helpers appear unused when compiled independently

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use telemetry_fanout::{native, AppState, Config};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

pub const TEST_SECRET: &str = "integration-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestApp {
    pub base_url: String,
    pub ws_url: String,
    pub state: AppState,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<bool>>,
}

impl TestApp {
    /// A token signed with the server's secret.
    pub fn token(&self) -> String {
        self.state
            .broadcaster
            .verifier()
            .issue("integration", Duration::from_secs(300))
            .unwrap()
    }

    /// Stop the server and return whether the queue drained.
    pub async fn stop(self) -> bool {
        let _ = self.shutdown_tx.send(());
        self.handle
            .await
            .expect("server task panicked")
            .expect("server error")
    }
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// Config tuned for tests: fast retries, small queue.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.queue.concurrency = 2;
    config.queue.backoff_base_ms = 1;
    config.queue.backoff_max_ms = 10;
    config.queue.shutdown_timeout_secs = 5;
    config.auth.jwt_secret = Some(TEST_SECRET.to_string());
    config
}

/// Boot the full router on an ephemeral loopback port.
pub async fn spawn_app(config: Config) -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind app listener");
    let addr = listener.local_addr().unwrap();
    let state = native::build_state(&config, TEST_SECRET);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server_state = state.clone();
    let handle = tokio::spawn(async move {
        native::serve(
            listener,
            server_state,
            config.queue.shutdown_timeout(),
            async {
                let _ = shutdown_rx.await;
            },
        )
        .await
    });

    TestApp {
        base_url: format!("http://{}", addr),
        ws_url: format!("ws://{}/ws", addr),
        state,
        shutdown_tx,
        handle,
    }
}

pub async fn connect_ws(app: &TestApp) -> WsClient {
    let (ws, _) = connect_async(&app.ws_url)
        .await
        .expect("websocket connect failed");
    ws
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("websocket send failed");
}

/// Next server envelope, or `None` if nothing arrives in time.
pub async fn next_event(ws: &mut WsClient, timeout: Duration) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(timeout, ws.next()).await.ok()??;
        match msg {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => continue,
        }
    }
}

/// Skip events until one named `event` arrives.
pub async fn expect_event(ws: &mut WsClient, event: &str) -> Value {
    for _ in 0..WAIT_ATTEMPTS {
        match next_event(ws, Duration::from_secs(5)).await {
            Some(envelope) if envelope["event"] == event => return envelope,
            Some(_) => continue,
            None => break,
        }
    }
    panic!("timed out waiting for '{}' event", event);
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}

pub fn points(n: usize, point_type: &str) -> Vec<Value> {
    (0..n)
        .map(|i| serde_json::json!({"type": point_type, "value": i as f64}))
        .collect()
}
