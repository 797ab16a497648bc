//! Test utilities and common setup.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use chatrelay::api::{self, AppState};
use chatrelay::db::Database;
use chatrelay::inference::{
    InferenceBackend, InferenceError, InferenceOutput, InferenceRequest, InferenceResult,
};
use chatrelay::relay::{RelayHub, RelaySettings};
use chatrelay::store::{SessionStore, SqliteSessionStore};
use chatrelay_protocol::ServerEvent;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for the next server event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One canned backend answer.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Raw stream chunks, each delivered after `delay`.
    Stream { chunks: Vec<String>, delay: Duration },
    /// A complete, non-streamed reply.
    Text(String),
    /// The request fails outright.
    Fail,
}

impl Reply {
    /// Event-stream frames carrying `fragments`, terminated by `[DONE]`.
    pub fn sse(fragments: &[&str]) -> Self {
        Self::sse_with_delay(fragments, Duration::ZERO)
    }

    pub fn sse_with_delay(fragments: &[&str], delay: Duration) -> Self {
        let mut chunks: Vec<String> = fragments
            .iter()
            .map(|f| format!("data: {}\n\n", serde_json::json!({ "response": f })))
            .collect();
        chunks.push("data: [DONE]\n\n".to_string());
        Self::Stream { chunks, delay }
    }
}

/// Backend that plays queued replies in order, then repeats a fallback,
/// recording every request it receives.
pub struct ScriptedBackend {
    queued: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<(String, InferenceRequest)>>,
}

impl ScriptedBackend {
    pub fn new(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.queued.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> Vec<(String, InferenceRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.calls().into_iter().map(|(model, _)| model).collect()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn run(&self, model: &str, request: InferenceRequest) -> InferenceResult<InferenceOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), request));

        let reply = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Text(text) => Ok(InferenceOutput::Text(text)),
            Reply::Fail => Err(InferenceError::Api {
                status: 503,
                message: "model overloaded".to_string(),
            }),
            Reply::Stream { chunks, delay } => {
                let stream = futures::stream::iter(chunks).then(move |chunk| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok::<_, InferenceError>(Bytes::from(chunk))
                });
                Ok(InferenceOutput::Stream(stream.boxed()))
            }
        }
    }
}

pub async fn test_db() -> Database {
    let db = Database::in_memory().await.unwrap();
    SqliteSessionStore::new(db.pool().clone())
        .ensure_schema()
        .await
        .unwrap();
    db
}

pub fn test_hub(db: &Database, backend: Arc<ScriptedBackend>, settings: RelaySettings) -> Arc<RelayHub> {
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(db.pool().clone()));
    Arc::new(RelayHub::new(store, backend, settings))
}

/// Router over an in-memory database, for `oneshot` requests.
pub async fn test_app(backend: Arc<ScriptedBackend>) -> (Router, Arc<RelayHub>) {
    let db = test_db().await;
    let hub = test_hub(&db, backend, RelaySettings::default());
    let app = api::create_router(AppState::new(hub.clone(), db, Vec::new()));
    (app, hub)
}

/// A relay server listening on an ephemeral local port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub db: Database,
    pub hub: Arc<RelayHub>,
    pub backend: Arc<ScriptedBackend>,
}

impl TestServer {
    pub async fn start(backend: Arc<ScriptedBackend>) -> Self {
        Self::start_with(test_db().await, backend, RelaySettings::default()).await
    }

    pub async fn start_with(
        db: Database,
        backend: Arc<ScriptedBackend>,
        settings: RelaySettings,
    ) -> Self {
        let hub = test_hub(&db, backend.clone(), settings);
        let app = api::create_router(AppState::new(hub.clone(), db.clone(), Vec::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            db,
            hub,
            backend,
        }
    }

    pub async fn connect(&self, session_id: &str) -> WsClient {
        let url = format!("ws://{}/api/sessions/{}/ws", self.addr, session_id);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    /// Connect and consume the `ready` event, returning its snapshot.
    pub async fn join(&self, session_id: &str) -> (WsClient, chatrelay_protocol::SessionSnapshot) {
        let mut ws = self.connect(session_id).await;
        match next_event(&mut ws).await {
            ServerEvent::Ready { state } => (ws, state),
            other => panic!("expected ready, got {other:?}"),
        }
    }
}

pub async fn send_raw(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

pub async fn send_chat(ws: &mut WsClient, text: &str) {
    let frame = serde_json::json!({ "type": "chat", "text": text }).to_string();
    send_raw(ws, &frame).await;
}

/// Next server event, skipping transport-level frames.
pub async fn next_event(ws: &mut WsClient) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(EVENT_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("connection closed")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Collect deltas up to and including `done`.
pub async fn collect_reply(ws: &mut WsClient) -> Vec<String> {
    let mut deltas = Vec::new();
    loop {
        match next_event(ws).await {
            ServerEvent::Delta { text } => deltas.push(text),
            ServerEvent::Done => return deltas,
            other => panic!("unexpected event while streaming: {other:?}"),
        }
    }
}
