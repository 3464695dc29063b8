use super::*;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const WAIT: Duration = Duration::from_secs(2);

fn ws_request(relay: &RelayHandle, token: Option<&str>) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let url = format!("ws://{}{WEBSOCKET_PATH}", relay.addr);
    let mut request = url.into_client_request().expect("valid url");
    if let Some(token) = token {
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(token).expect("valid header"));
    }
    request
}

#[test]
fn keepalive_is_echoed_verbatim() {
    let bytes = frames::prepare_request(1, frames::KEEPALIVE_VERB, frames::KEEPALIVE_PATH, None, &[]);
    assert_eq!(answer(&bytes), Outcome::Reply { bytes: bytes.clone(), path: None });
}

#[test]
fn request_is_answered_ok_with_body() {
    let bytes = frames::prepare_request(7, "PUT", "/v1/messages/a", Some("{\"x\":1}"), &[]);
    let Outcome::Reply { bytes: reply, path } = answer(&bytes) else {
        panic!("expected reply");
    };
    assert_eq!(path.as_deref(), Some("/v1/messages/a"));

    let frames::Message::Response(response) = frames::decode(&reply).expect("decode") else {
        panic!("expected response");
    };
    assert_eq!(response.id, 7);
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text().as_deref(), Some("{\"x\":1}"));
}

#[test]
fn client_response_is_an_ack() {
    let bytes = frames::prepare_response(9, 200, "OK", None, &[]);
    assert_eq!(answer(&bytes), Outcome::Ack(9));
    assert_eq!(answer(&[0xff, 0xff]), Outcome::Drop);
}

#[tokio::test]
async fn upgrade_without_token_is_rejected() {
    let relay = RelayHandle::spawn().await.expect("spawn relay");
    let result = tokio_tungstenite::connect_async(ws_request(&relay, None)).await;
    assert!(result.is_err(), "handshake should fail without a token");
}

#[tokio::test]
async fn token_is_echoed_and_pushes_reach_only_its_sockets() {
    let relay = RelayHandle::spawn().await.expect("spawn relay");
    let (mut ws, response) = tokio_tungstenite::connect_async(ws_request(&relay, Some("tokenA")))
        .await
        .expect("connect");
    assert_eq!(
        response.headers().get(SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok()),
        Some("tokenA")
    );
    assert!(relay.wait_for(WAIT, |s| s.live("tokenA") == 1).await);

    assert_eq!(relay.state().push("tokenB", b"nobody"), 0);
    let push = frames::prepare_request(3, "PUT", "/v1/queue/empty", None, &[]);
    assert_eq!(relay.state().push("tokenA", &push), 1);

    let received = tokio::time::timeout(WAIT, ws.next())
        .await
        .expect("push within timeout")
        .expect("stream open")
        .expect("frame");
    assert_eq!(received, WsMessage::Binary(push.into()));

    ws.send(WsMessage::Binary(frames::prepare_response(3, 200, "OK", None, &[]).into()))
        .await
        .expect("send ack");
    assert!(relay.wait_for(WAIT, |s| s.acks("tokenA") == [3]).await);

    ws.close(None).await.expect("close");
    assert!(relay.wait_for(WAIT, |s| s.live("tokenA") == 0).await);
    assert_eq!(relay.state().opened("tokenA"), 1);
}
