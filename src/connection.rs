//! Websocket connection bound to one credential set.
//!
//! DESIGN
//! ======
//! `listen()` performs the handshake and spawns three tasks per socket:
//! - writer: drains the outbound channel into the websocket sink
//! - reader: decodes frames → auto-ack → router → message hooks
//! - keepalive: `GET /v1/keepalive` on open, then every interval
//!
//! All three share `Inner` through an `Arc`. Every socket gets a generation
//! number; a reader that outlives its socket can only tear down its own
//! generation, never a newer one. Reconnecting is the caller's decision.
//!
//! LIFECYCLE
//! =========
//! 1. `listen()` → token offered as websocket sub-protocol → open hooks
//! 2. inbound frames → responses resolve `request()` waiters, the rest fan out
//! 3. `stop()` or peer close → running=false, pending requests abandoned,
//!    close hooks

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use frames::{KEEPALIVE_PATH, KEEPALIVE_VERB, Message, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, Credentials};
use crate::error::ErrorCode;
use crate::inbound::{self, BodyDecryptor, Incoming};
use crate::router::{RequestIds, Routed, Router, RouterError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

pub type OpenHook = Arc<dyn Fn() + Send + Sync>;
pub type MessageHook = Arc<dyn Fn(&Incoming) + Send + Sync>;
pub type CloseHook = Arc<dyn Fn(CloseReason) + Send + Sync>;

/// Why a socket went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` was called.
    Stopped,
    /// The peer closed the socket or the stream ended.
    Remote,
    /// Reading from the socket failed.
    Error,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("credentials require both host and access token")]
    MissingCredentials,
    /// The host is not an http(s) or ws(s) URL.
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("access token is not a valid sub-protocol header: {0}")]
    InvalidToken(#[from] InvalidHeaderValue),
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("connection is not running")]
    NotRunning,
}

impl ErrorCode for ConnectionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "E_MISSING_CREDENTIALS",
            Self::InvalidHost(_) => "E_INVALID_HOST",
            Self::InvalidToken(_) => "E_INVALID_TOKEN",
            Self::Connect(_) => "E_CONNECT",
            Self::ConnectTimeout(_) => "E_CONNECT_TIMEOUT",
            Self::NotRunning => "E_NOT_RUNNING",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ConnectTimeout(_) | Self::NotRunning)
    }
}

/// Failure of a correlated [`Connection::request`].
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Router(#[from] RouterError),
    /// No response within the request timeout; the request is UNMATCHED.
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: u64, after: Duration },
    /// The socket was torn down while the request was outstanding.
    #[error("request {id} abandoned: socket closed")]
    Abandoned { id: u64 },
}

impl ErrorCode for RequestError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Router(_) => "E_DUPLICATE_REQUEST_ID",
            Self::Timeout { .. } => "E_REQUEST_TIMEOUT",
            Self::Abandoned { .. } => "E_REQUEST_ABANDONED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.retryable(),
            Self::Router(_) => false,
            Self::Timeout { .. } | Self::Abandoned { .. } => true,
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// One websocket per credential set. Independent instances share nothing.
pub struct Connection {
    credentials: Credentials,
    config: ConnectionConfig,
    /// Serializes `listen()` so concurrent callers never open two sockets.
    connect_lock: tokio::sync::Mutex<()>,
    inner: Arc<Inner>,
}

impl Connection {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self::with_config(credentials, ConnectionConfig::default())
    }

    #[must_use]
    pub fn with_config(credentials: Credentials, config: ConnectionConfig) -> Self {
        Self {
            credentials,
            config,
            connect_lock: tokio::sync::Mutex::new(()),
            inner: Arc::new(Inner {
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                socket: Mutex::new(None),
                router: Router::new(),
                ids: RequestIds::new(),
                hooks: Hooks::default(),
                decryptor: RwLock::new(None),
            }),
        }
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Install the decryptor used to open chat deliveries.
    pub fn set_decryptor(&self, decryptor: Arc<dyn BodyDecryptor>) {
        *self.inner.decryptor.write().unwrap_or_else(PoisonError::into_inner) = Some(decryptor);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire) && self.has_socket()
    }

    #[must_use]
    pub fn has_socket(&self) -> bool {
        self.inner.lock_socket().is_some()
    }

    /// Number of sockets opened so far. Unchanged by a `listen()` that found
    /// the connection already running.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn outstanding_requests(&self) -> usize {
        self.inner.router.outstanding()
    }

    /// Open the socket and resolve once the handshake completes.
    ///
    /// Resolves immediately when already running.
    ///
    /// # Errors
    ///
    /// Returns an error for incomplete credentials, an unusable host or
    /// token, a failed handshake, or a handshake that exceeds the connect
    /// timeout.
    pub async fn listen(&self) -> Result<(), ConnectionError> {
        let _connecting = self.connect_lock.lock().await;
        if self.is_running() {
            debug!(generation = self.generation(), "chat socket: already running");
            return Ok(());
        }
        if !self.credentials.is_complete() {
            return Err(ConnectionError::MissingCredentials);
        }

        let url = websocket_url(&self.credentials.host)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Connect(Box::new(e)))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(self.credentials.access_token.trim())?,
        );

        let (stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(url.clone()))?
            .map_err(|e| ConnectionError::Connect(Box::new(e)))?;

        let generation = self.inner.start(stream, self.config.keepalive);
        info!(%url, generation, "chat socket: connected");
        self.inner.hooks.fire_open();
        Ok(())
    }

    /// Queue one binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotRunning`] when no socket is open; the
    /// frame is dropped.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.inner.send_bytes(bytes).inspect_err(|_| {
            debug!("chat socket: send while not running, frame dropped");
        })
    }

    /// Send a request and wait for the response carrying the same id.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Timeout`] when no response arrives within the
    /// request timeout and [`RequestError::Abandoned`] when the socket closes
    /// first.
    pub async fn request(
        &self,
        verb: &str,
        path: &str,
        body: Option<&str>,
        headers: &[String],
    ) -> Result<Response, RequestError> {
        if !self.is_running() {
            return Err(ConnectionError::NotRunning.into());
        }
        let id = self.inner.ids.next();
        let rx = self.inner.router.register(id, verb, path)?;
        if let Err(e) = self.send(frames::prepare_request(id, verb, path, body, headers)) {
            self.inner.router.abandon(id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RequestError::Abandoned { id }),
            Err(_) => {
                self.inner.router.abandon(id);
                warn!(id, %verb, %path, "chat socket: request timed out");
                Err(RequestError::Timeout { id, after: self.config.request_timeout })
            }
        }
    }

    /// Acknowledge a server request with `200 OK`. Chat deliveries are acked
    /// this way once the application has stored them.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotRunning`] when no socket is open.
    pub fn ack(&self, id: u64) -> Result<(), ConnectionError> {
        self.send(frames::prepare_response(id, 200, "OK", None, &[]))
    }

    /// Close the socket. Safe to call repeatedly or before `listen()`.
    pub fn stop(&self) {
        if !self.inner.teardown(None, CloseReason::Stopped) {
            debug!("chat socket: stop without an open socket");
        }
    }

    pub fn on_open(&self, hook: impl Fn() + Send + Sync + 'static) {
        push_hook(&self.inner.hooks.open, Arc::new(hook));
    }

    /// Receives every pushed frame: server requests and responses that no
    /// outstanding request claimed.
    pub fn on_message(&self, hook: impl Fn(&Incoming) + Send + Sync + 'static) {
        push_hook(&self.inner.hooks.message, Arc::new(hook));
    }

    pub fn on_close(&self, hook: impl Fn(CloseReason) + Send + Sync + 'static) {
        push_hook(&self.inner.hooks.close, Arc::new(hook));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.teardown(None, CloseReason::Stopped);
    }
}

/// Build `${host}/v1/websocket/`, mapping `http(s)://` to `ws(s)://`.
///
/// # Errors
///
/// Returns [`ConnectionError::InvalidHost`] for any other scheme.
pub fn websocket_url(host: &str) -> Result<String, ConnectionError> {
    let trimmed = host.trim().trim_end_matches('/');
    let lower = trimmed.to_ascii_lowercase();
    let base = if lower.starts_with("https://") {
        format!("wss://{}", &trimmed["https://".len()..])
    } else if lower.starts_with("http://") {
        format!("ws://{}", &trimmed["http://".len()..])
    } else if lower.starts_with("wss://") || lower.starts_with("ws://") {
        trimmed.to_owned()
    } else {
        return Err(ConnectionError::InvalidHost(host.to_owned()));
    };
    Ok(format!("{base}/v1/websocket/"))
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Socket {
    generation: u64,
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

struct Inner {
    running: AtomicBool,
    generation: AtomicU64,
    /// Current socket. `running` only changes while this lock is held.
    socket: Mutex<Option<Socket>>,
    router: Router,
    ids: RequestIds,
    hooks: Hooks,
    decryptor: RwLock<Option<Arc<dyn BodyDecryptor>>>,
}

impl Inner {
    fn lock_socket(&self) -> MutexGuard<'_, Option<Socket>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the socket tasks and publish the socket. Returns its generation.
    fn start(self: &Arc<Self>, stream: WsStream, keepalive: Duration) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (sink, stream) = stream.split();
        let (outbound, rx) = mpsc::unbounded_channel();

        // Held while spawning so tasks never observe a half-published socket.
        let mut slot = self.lock_socket();
        tokio::spawn(write_loop(sink, rx, generation));
        let reader = tokio::spawn(read_loop(Arc::clone(self), stream, generation));
        let keepalive = tokio::spawn(keepalive_loop(Arc::clone(self), keepalive, generation));
        *slot = Some(Socket { generation, outbound, reader, keepalive });
        self.running.store(true, Ordering::Release);
        generation
    }

    fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let slot = self.lock_socket();
        let Some(socket) = slot.as_ref() else {
            return Err(ConnectionError::NotRunning);
        };
        if !self.running.load(Ordering::Acquire) {
            return Err(ConnectionError::NotRunning);
        }
        socket
            .outbound
            .send(WsMessage::Binary(bytes.into()))
            .map_err(|_| ConnectionError::NotRunning)
    }

    /// Tear down the socket of `generation` (any socket when `None`).
    /// Returns whether a socket was actually torn down.
    fn teardown(&self, generation: Option<u64>, reason: CloseReason) -> bool {
        let socket = {
            let mut slot = self.lock_socket();
            let matches = slot
                .as_ref()
                .is_some_and(|s| generation.is_none_or(|g| g == s.generation));
            if !matches {
                return false;
            }
            self.running.store(false, Ordering::Release);
            slot.take()
        };
        let Some(socket) = socket else {
            return false;
        };

        socket.keepalive.abort();
        if reason == CloseReason::Stopped {
            let close = CloseFrame { code: CloseCode::Normal, reason: "OK".into() };
            let _ = socket.outbound.send(WsMessage::Close(Some(close)));
            socket.reader.abort();
        }
        // Dropping the sender lets the writer flush and exit.
        drop(socket.outbound);

        let abandoned = self.router.abandon_all();
        info!(generation = socket.generation, ?reason, abandoned, "chat socket: closed");
        self.hooks.fire_close(reason);
        true
    }

    async fn handle_binary(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let message = match frames::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "chat socket: dropping undecodable frame");
                return;
            }
        };

        if let Some(id) = inbound::auto_ack_id(&message) {
            if let Err(e) = self.send_bytes(frames::prepare_response(id, 200, "OK", None, &[])) {
                debug!(id, error = %e, "chat socket: auto-ack not sent");
            }
        }

        let envelope = match &message {
            Message::Request(request) if request.is_chat_delivery() => {
                let decryptor = self.decryptor.read().unwrap_or_else(PoisonError::into_inner).clone();
                match decryptor {
                    Some(decryptor) => match inbound::open_envelope(decryptor.as_ref(), request).await {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(id = request.id, error = %e, "chat socket: envelope not opened");
                            None
                        }
                    },
                    None => None,
                }
            }
            _ => None,
        };

        match self.router.route(message) {
            Routed::Push(message) => self.hooks.fire_message(&Incoming { message, envelope }),
            Routed::Resolved { .. } | Routed::Noop => {}
            Routed::Ignored { wire_type } => {
                debug!(wire_type, "chat socket: ignoring frame of unknown type");
            }
        }
    }
}

// =============================================================================
// HOOKS
// =============================================================================

#[derive(Default)]
struct Hooks {
    open: RwLock<Vec<OpenHook>>,
    message: RwLock<Vec<MessageHook>>,
    close: RwLock<Vec<CloseHook>>,
}

impl Hooks {
    fn fire_open(&self) {
        for hook in snapshot(&self.open) {
            hook();
        }
    }

    fn fire_message(&self, incoming: &Incoming) {
        for hook in snapshot(&self.message) {
            hook(incoming);
        }
    }

    fn fire_close(&self, reason: CloseReason) {
        for hook in snapshot(&self.close) {
            hook(reason);
        }
    }
}

/// Hooks run outside the lock so they may register further hooks.
fn snapshot<T: Clone>(hooks: &RwLock<Vec<T>>) -> Vec<T> {
    hooks.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn push_hook<T>(hooks: &RwLock<Vec<T>>, hook: T) {
    hooks.write().unwrap_or_else(PoisonError::into_inner).push(hook);
}

// =============================================================================
// SOCKET TASKS
// =============================================================================

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
    generation: u64,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, WsMessage::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(generation, error = %e, "chat socket: write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<Inner>, mut stream: SplitStream<WsStream>, generation: u64) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Binary(bytes))) => inner.handle_binary(&bytes).await,
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(generation, ?frame, "chat socket: peer closed");
                break CloseReason::Remote;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(generation, error = %e, "chat socket: read failed");
                break CloseReason::Error;
            }
            None => break CloseReason::Remote,
        }
    };
    inner.teardown(Some(generation), reason);
}

async fn keepalive_loop(inner: Arc<Inner>, period: Duration, generation: u64) {
    let mut ticker = tokio::time::interval(period.max(MIN_KEEPALIVE));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let id = inner.ids.next();
        inner.router.note_keepalive(id);
        if inner
            .send_bytes(frames::prepare_request(id, KEEPALIVE_VERB, KEEPALIVE_PATH, None, &[]))
            .is_err()
        {
            debug!(generation, "chat socket: keepalive stopped");
            break;
        }
        debug!(generation, id, "chat socket: keepalive sent");
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
