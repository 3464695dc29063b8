use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;

use relay::RelayHandle;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};

use super::*;

const WAIT: Duration = Duration::from_secs(2);

async fn relay() -> RelayHandle {
    RelayHandle::spawn().await.expect("relay should bind")
}

fn connection(relay: &RelayHandle, token: &str) -> Connection {
    Connection::new(Credentials::new(relay.host(), token))
}

/// Forward every message-hook delivery into a channel.
fn capture(conn: &Connection) -> UnboundedReceiver<Incoming> {
    let (tx, rx) = mpsc::unbounded_channel();
    conn.on_message(move |incoming| {
        let _ = tx.send(incoming.clone());
    });
    rx
}

async fn next_incoming(rx: &mut UnboundedReceiver<Incoming>) -> Incoming {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("message within timeout")
        .expect("hook channel open")
}

/// Poll `check` until it holds or `WAIT` elapses.
async fn eventually(check: impl Fn() -> bool) -> bool {
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT, poll).await.is_ok()
}

/// Treats the ciphertext as already-decrypted plaintext.
struct Passthrough;

#[async_trait::async_trait]
impl BodyDecryptor for Passthrough {
    async fn decrypt(&self, body_b64: &str) -> Result<String, inbound::InboundError> {
        Ok(body_b64.to_owned())
    }
}

/// Websocket peer that accepts the offered token as sub-protocol, then reads
/// and discards every frame without ever answering.
struct SilentPeer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    close: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SilentPeer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let (close, _) = broadcast::channel(1);

        let counter = accepted.clone();
        let closer = close.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(run_silent_socket(stream, counter.clone(), closer.subscribe()));
            }
        });
        Self { addr, accepted, close, task }
    }

    fn host(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close every socket open right now. Later sockets stay open.
    fn close_all(&self) {
        let _ = self.close.send(());
    }
}

impl Drop for SilentPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn select_protocol(
    request: &HandshakeRequest,
    mut response: HandshakeResponse,
) -> Result<HandshakeResponse, ErrorResponse> {
    if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    Ok(response)
}

async fn run_silent_socket(stream: TcpStream, accepted: Arc<AtomicUsize>, mut closing: broadcast::Receiver<()>) {
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, select_protocol).await else {
        return;
    };
    accepted.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            frame = ws.next() => {
                if !matches!(frame, Some(Ok(_))) {
                    return;
                }
            }
            _ = closing.recv() => {
                let _ = ws.close(None).await;
                while let Some(Ok(_)) = ws.next().await {}
                return;
            }
        }
    }
}

// =============================================================================
// URL
// =============================================================================

#[test]
fn websocket_url_maps_schemes() {
    assert_eq!(websocket_url("https://chat.example.org").expect("https"), "wss://chat.example.org/v1/websocket/");
    assert_eq!(websocket_url("http://127.0.0.1:9000/").expect("http"), "ws://127.0.0.1:9000/v1/websocket/");
    assert_eq!(websocket_url("wss://chat.example.org").expect("wss"), "wss://chat.example.org/v1/websocket/");
    assert!(matches!(websocket_url("ftp://x"), Err(ConnectionError::InvalidHost(_))));
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn two_connections_with_distinct_tokens_run_independently() {
    let relay = relay().await;
    let conn1 = connection(&relay, "uniqueAccessToken1");
    let conn2 = connection(&relay, "uniqueAccessToken2");

    let (first, second) = tokio::join!(conn1.listen(), conn2.listen());
    first.expect("conn1 listen");
    second.expect("conn2 listen");

    assert!(conn1.is_running() && conn1.has_socket());
    assert!(conn2.is_running() && conn2.has_socket());
    assert!(relay.wait_for(WAIT, |s| s.live("uniqueAccessToken1") == 1 && s.live("uniqueAccessToken2") == 1).await);

    conn2.stop();
    assert!(!conn2.is_running());
    assert!(conn1.is_running(), "stopping one connection must not affect the other");
}

#[tokio::test]
async fn reply_reaches_only_the_sending_connection() {
    let relay = relay().await;
    let conn1 = connection(&relay, "uniqueAccessToken1");
    let conn2 = connection(&relay, "uniqueAccessToken2");
    let mut rx1 = capture(&conn1);
    let mut rx2 = capture(&conn2);
    conn1.listen().await.expect("conn1 listen");
    conn2.listen().await.expect("conn2 listen");

    let body = r#"{"message":"hello from websocket1"}"#;
    conn1
        .send(frames::prepare_request(4_242, "PUT", "/v1/messages/websocket1", Some(body), &[]))
        .expect("send");

    let incoming = next_incoming(&mut rx1).await;
    assert_eq!(incoming.wire_type(), 2);
    assert_eq!(incoming.message.id(), Some(4_242));
    assert_eq!(incoming.body_text().as_deref(), Some(body));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx2.try_recv().is_err(), "connection 2 must not see connection 1's reply");
}

#[tokio::test]
async fn listen_twice_opens_one_socket() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenTwice");
    conn.listen().await.expect("first listen");
    conn.listen().await.expect("second listen");

    assert_eq!(conn.generation(), 1);
    assert!(relay.wait_for(WAIT, |s| s.live("tokenTwice") == 1).await);
    assert_eq!(relay.state().opened("tokenTwice"), 1);
}

#[tokio::test]
async fn stop_then_listen_opens_a_fresh_socket() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenRestart");
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    conn.on_close(move |reason| {
        assert_eq!(reason, CloseReason::Stopped);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    conn.listen().await.expect("listen");
    conn.stop();
    assert!(!conn.is_running());
    assert!(!conn.has_socket());
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    conn.listen().await.expect("listen again");
    assert!(conn.is_running());
    assert_eq!(conn.generation(), 2);
    assert!(relay.wait_for(WAIT, |s| s.opened("tokenRestart") == 2 && s.live("tokenRestart") == 1).await);
}

#[tokio::test]
async fn stop_without_listen_is_harmless() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenIdle");
    conn.stop();
    conn.stop();
    assert!(!conn.is_running());
    assert!(matches!(conn.send(vec![1, 2, 3]), Err(ConnectionError::NotRunning)));
}

#[tokio::test]
async fn open_hook_fires_after_handshake() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenOpen");
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = opens.clone();
    conn.on_open(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    conn.listen().await.expect("listen");
    conn.listen().await.expect("listen again");
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_registered_hook_fires() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenFanout");
    let opens = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counter = opens.clone();
        conn.on_open(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    let mut first = capture(&conn);
    let mut second = capture(&conn);

    conn.listen().await.expect("listen");
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert!(relay.wait_for(WAIT, |s| s.live("tokenFanout") == 1).await);

    relay.state().push("tokenFanout", &frames::prepare_request(31, "PUT", "/v1/queue/empty", None, &[]));
    assert_eq!(next_incoming(&mut first).await.message.id(), Some(31));
    assert_eq!(next_incoming(&mut second).await.message.id(), Some(31));
}

#[tokio::test]
async fn peer_close_fires_close_hooks_and_allows_relisten() {
    let peer = SilentPeer::spawn().await;
    let conn = Connection::new(Credentials::new(peer.host(), "tokenPeerClose"));
    let (tx, mut closes) = mpsc::unbounded_channel();
    conn.on_close(move |reason| {
        let _ = tx.send(reason);
    });

    conn.listen().await.expect("listen");
    assert!(eventually(|| peer.accepted() == 1).await);
    peer.close_all();

    let reason = tokio::time::timeout(WAIT, closes.recv())
        .await
        .expect("close within timeout")
        .expect("hook channel open");
    assert_eq!(reason, CloseReason::Remote);
    assert!(!conn.is_running());
    assert!(!conn.has_socket());

    conn.listen().await.expect("listen again");
    assert!(conn.is_running());
    assert_eq!(conn.generation(), 2);
    assert!(eventually(|| peer.accepted() == 2).await);
    assert!(closes.try_recv().is_err(), "the new socket stays open");
}

#[tokio::test]
async fn missing_credentials_are_rejected() {
    let conn = Connection::new(Credentials::new("http://127.0.0.1:1", "  "));
    let err = conn.listen().await.expect_err("no token");
    assert!(matches!(err, ConnectionError::MissingCredentials));
    assert_eq!(err.error_code(), "E_MISSING_CREDENTIALS");
    assert!(!err.retryable());
}

#[tokio::test]
async fn unreachable_host_is_a_retryable_connect_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let conn = Connection::new(Credentials::new(format!("http://{addr}"), "token"));
    let err = conn.listen().await.expect_err("nothing listening");
    assert!(err.retryable(), "got {err}");
    assert!(!conn.is_running());
}

// =============================================================================
// REQUESTS
// =============================================================================

#[tokio::test]
async fn request_resolves_with_matching_response() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenRequest");
    let mut rx = capture(&conn);
    conn.listen().await.expect("listen");

    let response = conn
        .request("PUT", "/v1/messages/bob", Some(r#"{"n":1}"#), &[])
        .await
        .expect("response");
    assert!(response.is_success());
    assert_eq!(response.body_text().as_deref(), Some(r#"{"n":1}"#));
    assert_eq!(conn.outstanding_requests(), 0);
    assert_eq!(relay.state().requests("tokenRequest"), ["/v1/messages/bob"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "a claimed response is not a push");
}

#[tokio::test]
async fn request_before_listen_fails_fast() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenEarly");
    let err = conn.request("GET", "/v1/x", None, &[]).await.expect_err("not running");
    assert!(matches!(err, RequestError::Connection(ConnectionError::NotRunning)));
}

#[tokio::test]
async fn unanswered_request_times_out_and_is_released() {
    let peer = SilentPeer::spawn().await;
    let config = ConnectionConfig { request_timeout: Duration::from_millis(200), ..ConnectionConfig::default() };
    let conn = Connection::with_config(Credentials::new(peer.host(), "tokenTimeout"), config);
    conn.listen().await.expect("listen");

    let err = conn.request("GET", "/v1/slow", None, &[]).await.expect_err("nobody answers");
    assert!(matches!(err, RequestError::Timeout { after, .. } if after == Duration::from_millis(200)), "got {err}");
    assert_eq!(conn.outstanding_requests(), 0);
    assert!(conn.is_running(), "a timeout does not close the socket");
}

#[tokio::test]
async fn stop_abandons_requests_in_flight() {
    let peer = SilentPeer::spawn().await;
    let conn = Connection::new(Credentials::new(peer.host(), "tokenAbandon"));
    conn.listen().await.expect("listen");

    let stopper = async {
        assert!(eventually(|| conn.outstanding_requests() == 1).await, "request registered");
        conn.stop();
    };
    let (result, ()) = tokio::join!(conn.request("GET", "/v1/slow", None, &[]), stopper);

    let err = result.expect_err("socket closed first");
    assert!(matches!(err, RequestError::Abandoned { .. }), "got {err}");
    assert_eq!(conn.outstanding_requests(), 0);
}

// =============================================================================
// INBOUND
// =============================================================================

#[tokio::test]
async fn server_requests_are_auto_acked_except_chat_deliveries() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenPush");
    let mut rx = capture(&conn);
    conn.listen().await.expect("listen");
    assert!(relay.wait_for(WAIT, |s| s.live("tokenPush") == 1).await);

    let push = frames::prepare_request(42, "PUT", "/v1/queue/empty", None, &[]);
    assert_eq!(relay.state().push("tokenPush", &push), 1);
    let incoming = next_incoming(&mut rx).await;
    assert_eq!(incoming.wire_type(), 1);
    assert!(relay.wait_for(WAIT, |s| s.acks("tokenPush").contains(&42)).await);

    let chat = frames::prepare_request(43, "PUT", frames::INCOMING_MESSAGE_PATH, None, &[]);
    relay.state().push("tokenPush", &chat);
    let incoming = next_incoming(&mut rx).await;
    assert_eq!(incoming.message.id(), Some(43));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!relay.state().acks("tokenPush").contains(&43), "chat deliveries wait for the caller");

    conn.ack(43).expect("ack");
    assert!(relay.wait_for(WAIT, |s| s.acks("tokenPush").contains(&43)).await);
}

#[tokio::test]
async fn keepalives_are_sent_and_their_echo_is_swallowed() {
    let relay = relay().await;
    let config = ConnectionConfig { keepalive: Duration::from_millis(50), ..ConnectionConfig::default() };
    let conn = Connection::with_config(Credentials::new(relay.host(), "tokenKeepalive"), config);
    let mut rx = capture(&conn);
    conn.listen().await.expect("listen");

    assert!(relay.wait_for(WAIT, |s| s.keepalives("tokenKeepalive") >= 3).await);
    assert!(rx.try_recv().is_err(), "keepalive traffic never reaches message hooks");
    assert!(conn.is_running());
}

#[tokio::test]
async fn garbage_frames_are_dropped_without_closing() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenGarbage");
    let mut rx = capture(&conn);
    conn.listen().await.expect("listen");
    assert!(relay.wait_for(WAIT, |s| s.live("tokenGarbage") == 1).await);

    relay.state().push("tokenGarbage", &[0xff, 0xff, 0xff]);
    relay.state().push("tokenGarbage", &frames::prepare_request(7, "PUT", "/v1/queue/empty", None, &[]));

    let incoming = next_incoming(&mut rx).await;
    assert_eq!(incoming.message.id(), Some(7));
    assert!(conn.is_running());
}

#[tokio::test]
async fn chat_delivery_envelope_is_opened_by_the_decryptor() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenDecrypt");
    conn.set_decryptor(Arc::new(Passthrough));
    let mut rx = capture(&conn);
    conn.listen().await.expect("listen");
    assert!(relay.wait_for(WAIT, |s| s.live("tokenDecrypt") == 1).await);

    let envelope = frames::Envelope {
        envelope_type: frames::EnvelopeType::Ciphertext,
        source: Some("alice".into()),
        timestamp: Some(1_234),
        ..frames::Envelope::default()
    };
    let delivery = frames::encode(&Message::Request(
        frames::Request::new(44, "PUT", frames::INCOMING_MESSAGE_PATH)
            .with_body(frames::encode_envelope(&envelope))
            .with_header("tag:chat"),
    ));
    relay.state().push("tokenDecrypt", &delivery);

    let incoming = next_incoming(&mut rx).await;
    assert_eq!(incoming.envelope.as_ref(), Some(&envelope));
    let pending = incoming.pending_message().expect("pending message");
    assert_eq!(pending.source, "alice");
    assert_eq!(pending.request_id, Some(44));
}

#[tokio::test]
async fn other_verbs_on_the_message_path_are_not_opened() {
    let relay = relay().await;
    let conn = connection(&relay, "tokenGetMessage");
    conn.set_decryptor(Arc::new(Passthrough));
    let mut rx = capture(&conn);
    conn.listen().await.expect("listen");
    assert!(relay.wait_for(WAIT, |s| s.live("tokenGetMessage") == 1).await);

    let envelope = frames::Envelope {
        envelope_type: frames::EnvelopeType::Ciphertext,
        source: Some("mallory".into()),
        ..frames::Envelope::default()
    };
    let frame = frames::encode(&Message::Request(
        frames::Request::new(45, "GET", frames::INCOMING_MESSAGE_PATH).with_body(frames::encode_envelope(&envelope)),
    ));
    relay.state().push("tokenGetMessage", &frame);

    let incoming = next_incoming(&mut rx).await;
    assert_eq!(incoming.message.id(), Some(45));
    assert!(incoming.envelope.is_none());
    assert!(incoming.pending_message().is_none());
}
