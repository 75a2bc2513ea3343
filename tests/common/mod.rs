//! In-process stand-in for the voice backend.
//!
//! Serves the three WebSocket channels and the product-info HTTP routes on an
//! ephemeral port. Behaviour is steered through [`BackendState`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tower_http::trace::TraceLayer;

use voice_client::{Entry, Settings};
use voice_session::{Configuration, ReconnectPolicy};

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct BackendState {
    /// `(path, user_id)` for every accepted upgrade.
    pub connections: Mutex<Vec<(String, Option<String>)>>,
    pub chat: Mutex<Vec<String>>,
    pub audio_bytes: AtomicUsize,
    pub resets: AtomicUsize,
    /// Conversation sockets to drop without a close handshake.
    pub drop_next: AtomicUsize,
    /// Close code the next conversation socket is closed with right after opening.
    pub close_next: Mutex<Option<(u16, String)>>,
    /// Reject product-info clients with 4000 until the next reset.
    pub reject_product_info: AtomicBool,
    /// Answer product-info resets with 503.
    pub reject_reset: AtomicBool,
}

impl BackendState {
    pub fn connection_count(&self, path: &str) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    fn record(&self, path: &str, params: &HashMap<String, String>) {
        self.connections
            .lock()
            .unwrap()
            .push((path.to_string(), params.get("user_id").cloned()));
    }
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<BackendState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(BackendState::default());
        let app = Router::new()
            .route("/ws", get(ws_conversation))
            .route("/ws/tools", get(ws_tools))
            .route("/ws/product_info", get(ws_product_info))
            .route("/product-info-status", get(product_info_status))
            .route("/product-info-reset", post(product_info_reset))
            .route("/connect", get(bootstrap))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    /// Settings pointing at this backend with a short fixed reconnect delay.
    pub fn settings(&self, user_id: Option<&str>) -> Settings {
        Settings {
            config: Configuration::new(self.addr.to_string(), false).unwrap(),
            user_id: user_id.map(str::to_string),
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(50)),
            microphone: None,
        }
    }
}

/// Waits for the first entry matching `pred`, discarding the ones before it.
pub async fn next_matching(
    entries: &mut UnboundedReceiver<Entry>,
    mut pred: impl FnMut(&Entry) -> bool,
) -> Entry {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let entry = entries.recv().await.expect("entry stream closed");
            if pred(&entry) {
                return entry;
            }
        }
    })
    .await
    .expect("timed out waiting for entry")
}

pub fn conversation_text(entry: &Entry) -> Option<&str> {
    match entry {
        Entry::Conversation(msg) => Some(msg.content.as_str()),
        _ => None,
    }
}

/// Polls `check` until it holds or the timeout elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

// ── Handlers ─────────────────────────────────────────────────────────────────

type Params = Query<HashMap<String, String>>;

async fn ws_conversation(
    ws: WebSocketUpgrade,
    Query(params): Params,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    state.record("/ws", &params);
    ws.on_upgrade(move |socket| handle_conversation(socket, state, params))
}

async fn handle_conversation(
    mut socket: WebSocket,
    state: Arc<BackendState>,
    params: HashMap<String, String>,
) {
    let dropped = state
        .drop_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if dropped {
        return;
    }

    let close = state.close_next.lock().unwrap().take();
    if let Some((code, reason)) = close {
        let frame = CloseFrame { code, reason: reason.into() };
        let _ = socket.send(Message::Close(Some(frame))).await;
        while let Some(Ok(_)) = socket.recv().await {}
        return;
    }

    let user = params.get("user_id").cloned().unwrap_or_default();
    let welcome = json!({ "type": "system", "message": format!("Welcome {user}") });
    if socket.send(Message::Text(welcome.to_string().into())).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let Ok(doc) = serde_json::from_str::<Value>(&text) else { continue };
                if doc["type"] == "chat" {
                    let text = doc["text"].as_str().unwrap_or_default().to_string();
                    state.chat.lock().unwrap().push(text.clone());
                    let reply = json!({ "type": "chat_response", "text": format!("echo: {text}") });
                    let _ = socket.send(Message::Text(reply.to_string().into())).await;
                }
            }
            Message::Binary(bytes) => {
                state.audio_bytes.fetch_add(bytes.len(), Ordering::SeqCst);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn ws_tools(
    ws: WebSocketUpgrade,
    Query(params): Params,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    state.record("/ws/tools", &params);
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let event = json!({ "type": "invoice_command", "action": "open", "invoice_id": 7 });
        let _ = socket.send(Message::Text(event.to_string().into())).await;
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    })
}

async fn ws_product_info(
    ws: WebSocketUpgrade,
    Query(params): Params,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    state.record("/ws/product_info", &params);
    let reject = state.reject_product_info.load(Ordering::SeqCst);
    ws.on_upgrade(move |mut socket: WebSocket| async move {
        if reject {
            let frame = CloseFrame { code: 4000, reason: "Duplicate connection".into() };
            let _ = socket.send(Message::Close(Some(frame))).await;
        } else {
            let event = json!({ "type": "product_info", "action": "update", "sku": "A-1" });
            let _ = socket.send(Message::Text(event.to_string().into())).await;
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    })
}

async fn product_info_status(State(state): State<Arc<BackendState>>) -> Json<Value> {
    let clients = state.connection_count("/ws/product_info");
    Json(json!({
        "success": true,
        "data": {
            "is_streaming": true,
            "external_connected": false,
            "has_clients": clients > 0,
            "last_message": null
        }
    }))
}

async fn product_info_reset(State(state): State<Arc<BackendState>>) -> Response {
    if state.reject_reset.load(Ordering::SeqCst) {
        let body = Json(json!({ "success": false, "error": "stream busy" }));
        return (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
    }
    state.resets.fetch_add(1, Ordering::SeqCst);
    state.reject_product_info.store(false, Ordering::SeqCst);
    Json(json!({ "success": true })).into_response()
}

async fn bootstrap() -> Json<Value> {
    Json(json!({ "ws_url": "/ws", "transport": "websocket" }))
}
