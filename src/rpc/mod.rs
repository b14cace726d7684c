//! WebSocket RPC surface.
//!
//! One HTTP listener serves `/health` and `/ws`. Browser upgrades pass
//! the origin guard before the socket opens; every connection then walks
//! the same state machine: hello (with token auth) → authenticated →
//! request/response + pushed events → closed.

pub mod events;
pub mod frames;
pub mod methods;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::gateway::auth::check_browser_origin;
use crate::gateway::Gateway;
use frames::{ClientFrame, ErrorShape, ServerFrame, PROTOCOL_VERSION};
use methods::MethodRegistry;

/// Outbound frames buffered per connection before the hub drops it.
const OUTBOUND_QUEUE: usize = 256;
/// Idempotency replay entries remembered per connection.
const REPLAY_CACHE: usize = 128;

#[derive(Clone)]
struct AppState {
    gw: Arc<Gateway>,
    methods: Arc<MethodRegistry>,
}

pub fn build_router(gw: Arc<Gateway>) -> Router {
    let state = AppState {
        gw,
        methods: Arc::new(MethodRegistry::standard()),
    };
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Bind and serve until the gateway's shutdown token fires.
pub async fn serve(gw: Arc<Gateway>, host: &str, port: u16) -> anyhow::Result<()> {
    let shutdown = gw.shutdown.clone();
    let router = build_router(gw);
    let listener = TcpListener::bind((host, port)).await?;
    info!("rpc listening on {host}:{port}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    // Non-browser clients (CLI, nodes) send no Origin header; they skip
    // the browser guard and are gated by token auth at the hello
    // handshake instead. The guard itself fails closed on `None`.
    if origin.is_some() {
        let cfg = state.gw.config.read().await.gateway.clone();
        if !check_browser_origin(origin, host, &cfg) {
            warn!(origin = origin.unwrap_or("<none>"), "websocket upgrade refused");
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Per-connection cache of responses already produced for an idempotency
/// key. A retried request replays the original response instead of
/// executing twice; a retry that races the original joins its in-flight
/// execution instead of starting a second one.
enum ReplaySlot {
    /// First request still executing; the count is how many duplicates
    /// arrived meanwhile and are owed a copy of its response.
    Pending(usize),
    Done(ServerFrame),
}

#[derive(Default)]
struct ReplayCache {
    map: HashMap<String, ReplaySlot>,
    // Eviction order over Done entries only; pending keys are bounded by
    // the connection's own in-flight requests.
    order: VecDeque<String>,
}

enum ReplayDecision {
    /// First sighting of the key: caller executes and must `complete`.
    Execute,
    /// Same key is already executing; the response will be sent when it
    /// completes.
    Joined,
    /// Finished earlier; send the cached response.
    Replay(ServerFrame),
}

impl ReplayCache {
    fn begin(&mut self, key: &str) -> ReplayDecision {
        match self.map.get_mut(key) {
            Some(ReplaySlot::Done(frame)) => ReplayDecision::Replay(frame.clone()),
            Some(ReplaySlot::Pending(joined)) => {
                *joined += 1;
                ReplayDecision::Joined
            }
            None => {
                self.map.insert(key.to_string(), ReplaySlot::Pending(0));
                ReplayDecision::Execute
            }
        }
    }

    /// Record the response for a key begun earlier. Returns how many
    /// duplicates joined while it ran, so the caller can send them their
    /// copies.
    fn complete(&mut self, key: String, frame: ServerFrame) -> usize {
        let joined = match self.map.insert(key.clone(), ReplaySlot::Done(frame)) {
            Some(ReplaySlot::Pending(joined)) => joined,
            _ => 0,
        };
        self.order.push_back(key);
        while self.order.len() > REPLAY_CACHE {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        joined
    }
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    // Handshake first; nothing else is accepted before an authenticated
    // hello.
    let hello_deadline = std::time::Duration::from_secs(10);
    let hello = tokio::time::timeout(hello_deadline, read_client_frame(&mut socket)).await;
    match hello {
        Ok(Some(ClientFrame::Hello {
            protocol_version,
            device_id,
            auth,
        })) => {
            if let Some(requested) = protocol_version {
                if requested != PROTOCOL_VERSION {
                    let _ = send_frame(
                        &mut socket,
                        &ServerFrame::HelloError {
                            error: ErrorShape::invalid(format!(
                                "unsupported protocol version {requested}"
                            )),
                        },
                    )
                    .await;
                    return;
                }
            }
            if let Err(e) = state.gw.auth.verify(auth.as_deref()) {
                let _ = send_frame(
                    &mut socket,
                    &ServerFrame::HelloError {
                        error: ErrorShape::from(&e),
                    },
                )
                .await;
                return;
            }
            debug!(device = device_id.as_deref().unwrap_or("unknown"), "client authenticated");
            let ok = ServerFrame::HelloOk {
                protocol: PROTOCOL_VERSION,
                server_version: format!("courier/{}", env!("CARGO_PKG_VERSION")),
                capabilities: state
                    .methods
                    .method_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            };
            if send_frame(&mut socket, &ok).await.is_err() {
                return;
            }
        }
        Ok(Some(_)) => {
            let _ = send_frame(
                &mut socket,
                &ServerFrame::HelloError {
                    error: ErrorShape::invalid("first frame must be hello"),
                },
            )
            .await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            debug!("hello timeout, closing");
            return;
        }
    }

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);
    let conn_id = state.gw.hub.register(out_tx.clone());
    let replay = Arc::new(tokio::sync::Mutex::new(ReplayCache::default()));

    loop {
        tokio::select! {
            // Outbound first: keep event delivery ahead of new work.
            biased;
            _ = state.gw.shutdown.cancelled() => break,
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        handle_text(&state, &out_tx, &replay, text.as_str()).await;
                    }
                    Message::Ping(data) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.gw.hub.unregister(conn_id);
    debug!(conn = conn_id, "connection closed");
}

/// Parse and act on one inbound text frame. Responses (and parse errors)
/// go through the connection's outbound queue.
async fn handle_text(
    state: &AppState,
    out_tx: &mpsc::Sender<ServerFrame>,
    replay: &Arc<tokio::sync::Mutex<ReplayCache>>,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = out_tx
                .send(ServerFrame::err("", ErrorShape::invalid(format!("bad frame: {e}"))))
                .await;
            return;
        }
    };
    match frame {
        ClientFrame::Hello { .. } => {
            let _ = out_tx
                .send(ServerFrame::err(
                    "",
                    ErrorShape::invalid("connection is already authenticated"),
                ))
                .await;
        }
        ClientFrame::Request {
            id,
            method,
            params,
            idempotency_key,
        } => {
            // Only methods declared idempotent may replay; a key on any
            // other method is ignored and the request executes again.
            let idempotency_key =
                idempotency_key.filter(|_| state.methods.is_idempotent(&method));
            if let Some(key) = &idempotency_key {
                match replay.lock().await.begin(key) {
                    ReplayDecision::Replay(cached) => {
                        debug!(method, key, "replaying cached response");
                        let _ = out_tx.send(cached).await;
                        return;
                    }
                    ReplayDecision::Joined => {
                        // A duplicate racing the original: the in-flight
                        // execution will send this request its response.
                        debug!(method, key, "joining in-flight request");
                        return;
                    }
                    ReplayDecision::Execute => {}
                }
            }
            // Run the request off the connection loop so a slow method
            // (agent.wait, node.invoke) never stalls event delivery.
            let gw = state.gw.clone();
            let methods = state.methods.clone();
            let out_tx = out_tx.clone();
            let replay = replay.clone();
            tokio::spawn(async move {
                let response = match methods.dispatch(gw, &method, params).await {
                    Ok(result) => ServerFrame::ok(id.clone(), result),
                    Err(e) => ServerFrame::err(id.clone(), ErrorShape::from(&e)),
                };
                if let Some(key) = idempotency_key {
                    let joined = replay.lock().await.complete(key, response.clone());
                    for _ in 0..joined {
                        let _ = out_tx.send(response.clone()).await;
                    }
                }
                let _ = out_tx.send(response).await;
            });
        }
    }
}

async fn read_client_frame(socket: &mut WebSocket) -> Option<ClientFrame> {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_cache_is_bounded_and_replays() {
        let mut cache = ReplayCache::default();
        assert!(matches!(cache.begin("k1"), ReplayDecision::Execute));
        cache.complete("k1".into(), ServerFrame::ok("1", json!({"n": 1})));
        assert!(matches!(cache.begin("k1"), ReplayDecision::Replay(_)));
        assert!(matches!(cache.begin("k2"), ReplayDecision::Execute));

        for i in 0..(REPLAY_CACHE + 10) {
            let key = format!("fill-{i}");
            let _ = cache.begin(&key);
            cache.complete(key, ServerFrame::ok("x", json!({})));
        }
        assert!(
            matches!(cache.begin("k1"), ReplayDecision::Execute),
            "oldest entries must be evicted"
        );
        assert!(matches!(
            cache.begin(&format!("fill-{}", REPLAY_CACHE + 9)),
            ReplayDecision::Replay(_)
        ));
    }

    #[test]
    fn concurrent_duplicates_join_the_first_execution() {
        let mut cache = ReplayCache::default();
        assert!(matches!(cache.begin("del"), ReplayDecision::Execute));
        // Retries landing before the first execution finishes must not
        // execute again; they wait for its response.
        assert!(matches!(cache.begin("del"), ReplayDecision::Joined));
        assert!(matches!(cache.begin("del"), ReplayDecision::Joined));

        let joined = cache.complete("del".into(), ServerFrame::ok("1", json!({"deleted": true})));
        assert_eq!(joined, 2, "both joined duplicates owed a response");

        // After completion further retries replay the cached response.
        match cache.begin("del") {
            ReplayDecision::Replay(ServerFrame::Response { result, .. }) => {
                assert_eq!(result.unwrap()["deleted"], json!(true));
            }
            _ => panic!("expected cached replay"),
        }
        assert_eq!(cache.order.len(), 1);
    }

    #[tokio::test]
    async fn router_health_endpoint_reports_ok() {
        use crate::gateway::testutil::test_gateway;
        let dir = tempfile::tempdir().unwrap();
        let (gw, _loopback) = test_gateway(&dir);
        let router = build_router(gw);

        let server = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(server, router).await.unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = stream;
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        assert!(buf.starts_with("HTTP/1.1 200"), "got: {buf}");
        assert!(buf.contains("\"status\":\"ok\""));
    }
}
