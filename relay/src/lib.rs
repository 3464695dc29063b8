//! Local stand-in for the chat websocket service.
//!
//! DESIGN
//! ======
//! `GET /v1/websocket/` upgrades when the `Sec-WebSocket-Protocol` header
//! carries an access token; the token is echoed back as the accepted
//! sub-protocol. Each socket then runs a `select!` loop:
//! - keepalive requests are echoed back verbatim
//! - other requests are answered `200 OK` with the request body echoed
//! - responses from the client are recorded as acknowledgements
//! - frames pushed for the socket's token are forwarded to it
//!
//! Sockets opened with different tokens never see each other's traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const WEBSOCKET_PATH: &str = "/v1/websocket/";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid PORT: {0}")]
    Port(#[from] std::num::ParseIntError),
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Default)]
struct Registry {
    next_conn: u64,
    /// Live sockets per token.
    sockets: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>,
    /// Sockets ever opened per token.
    opened: HashMap<String, usize>,
    /// Response ids received per token.
    acks: HashMap<String, Vec<u64>>,
    /// Request paths received per token, keepalives excluded.
    requests: HashMap<String, Vec<String>>,
    keepalives: HashMap<String, usize>,
}

/// Shared relay state. Cheap to clone.
#[derive(Clone, Default)]
pub struct RelayState {
    registry: Arc<Mutex<Registry>>,
}

impl RelayState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `bytes` to every live socket of `token`. Returns how many got it.
    pub fn push(&self, token: &str, bytes: &[u8]) -> usize {
        let registry = self.lock();
        let Some(sockets) = registry.sockets.get(token) else {
            return 0;
        };
        sockets.iter().filter(|(_, tx)| tx.send(bytes.to_vec()).is_ok()).count()
    }

    #[must_use]
    pub fn acks(&self, token: &str) -> Vec<u64> {
        self.lock().acks.get(token).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn requests(&self, token: &str) -> Vec<String> {
        self.lock().requests.get(token).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn keepalives(&self, token: &str) -> usize {
        self.lock().keepalives.get(token).copied().unwrap_or(0)
    }

    /// Sockets ever opened with `token`.
    #[must_use]
    pub fn opened(&self, token: &str) -> usize {
        self.lock().opened.get(token).copied().unwrap_or(0)
    }

    /// Sockets currently open with `token`.
    #[must_use]
    pub fn live(&self, token: &str) -> usize {
        self.lock().sockets.get(token).map_or(0, Vec::len)
    }

    fn register(&self, token: &str) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.lock();
        registry.next_conn += 1;
        let conn_id = registry.next_conn;
        registry.sockets.entry(token.to_owned()).or_default().push((conn_id, tx));
        *registry.opened.entry(token.to_owned()).or_default() += 1;
        (conn_id, rx)
    }

    fn unregister(&self, token: &str, conn_id: u64) {
        let mut registry = self.lock();
        if let Some(sockets) = registry.sockets.get_mut(token) {
            sockets.retain(|(id, _)| *id != conn_id);
        }
    }

    fn record(&self, token: &str, outcome: &Outcome) {
        let mut registry = self.lock();
        match outcome {
            Outcome::Ack(id) => registry.acks.entry(token.to_owned()).or_default().push(*id),
            Outcome::Reply { path: Some(path), .. } => {
                registry.requests.entry(token.to_owned()).or_default().push(path.clone());
            }
            Outcome::Reply { path: None, .. } => *registry.keepalives.entry(token.to_owned()).or_default() += 1,
            Outcome::Drop => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// FRAME HANDLING
// =============================================================================

/// What the relay does with one client frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Send `bytes` back. `path` is set for non-keepalive requests.
    Reply { bytes: Vec<u8>, path: Option<String> },
    /// The client acknowledged server request `id`.
    Ack(u64),
    Drop,
}

#[must_use]
pub fn answer(bytes: &[u8]) -> Outcome {
    match frames::decode(bytes) {
        Ok(frames::Message::Keepalive(_)) => Outcome::Reply { bytes: bytes.to_vec(), path: None },
        Ok(frames::Message::Request(request)) => {
            let mut response = frames::Response::new(request.id, 200, "OK");
            response.body = request.body;
            Outcome::Reply { bytes: frames::encode(&frames::Message::Response(response)), path: Some(request.path) }
        }
        Ok(frames::Message::Response(response)) => Outcome::Ack(response.id),
        Ok(frames::Message::Unknown { wire_type }) => {
            debug!(wire_type, "relay: dropping frame of unknown type");
            Outcome::Drop
        }
        Err(e) => {
            warn!(error = %e, "relay: dropping undecodable frame");
            Outcome::Drop
        }
    }
}

// =============================================================================
// ROUTES
// =============================================================================

pub fn app(state: RelayState) -> Router {
    Router::new().route(WEBSOCKET_PATH, get(handle_ws)).with_state(state)
}

pub async fn handle_ws(State(state): State<RelayState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let token = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned);
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "access token required").into_response();
    };

    ws.protocols([token.clone()])
        .on_upgrade(move |socket| run_socket(socket, state, token))
}

async fn run_socket(mut socket: WebSocket, state: RelayState, token: String) {
    let (conn_id, mut pushes) = state.register(&token);
    info!(conn_id, "relay: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        let outcome = answer(&bytes);
                        state.record(&token, &outcome);
                        if let Outcome::Reply { bytes, .. } = outcome {
                            if socket.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(bytes) = pushes.recv() => {
                if socket.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.unregister(&token, conn_id);
    info!(conn_id, "relay: client disconnected");
}

// =============================================================================
// IN-PROCESS HANDLE
// =============================================================================

/// A relay serving on an ephemeral local port until dropped.
pub struct RelayHandle {
    addr: SocketAddr,
    state: RelayState,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Bind `127.0.0.1:0` and serve in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Io`] if the listener cannot be bound.
    pub async fn spawn() -> Result<Self, RelayError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = RelayState::new();
        let router = app(state.clone());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "relay: server stopped");
            }
        });
        Ok(Self { addr, state, task })
    }

    /// Base URL to hand to a chat connection.
    #[must_use]
    pub fn host(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Poll `check` until it holds or `within` elapses.
    pub async fn wait_for(&self, within: Duration, check: impl Fn(&RelayState) -> bool) -> bool {
        let poll = async {
            while !check(&self.state) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(within, poll).await.is_ok()
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
