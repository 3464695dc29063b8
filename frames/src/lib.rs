//! Wire model and protobuf codec for the chat websocket sub-protocol.
//!
//! Every binary websocket frame is a `WebSocketMessage` carrying either a
//! request (`verb`, `path`, `body`, `headers`, `id`) or a response (`id`,
//! `status`, `message`, `body`, `headers`). Field numbers follow the Signal
//! websocket sub-protocol spoken by the chat service, so frames produced here
//! interoperate with it byte for byte.
//!
//! Incoming chat messages carry an encrypted `Envelope`. Decryption belongs to
//! the caller; the decrypted plaintext is decoded with [`decode_envelope`].

use prost::Message as _;
use serde::{Deserialize, Serialize};

/// Verb of the reserved keepalive request.
pub const KEEPALIVE_VERB: &str = "GET";

/// Path of the reserved keepalive request. Peers echo it back untouched.
pub const KEEPALIVE_PATH: &str = "/v1/keepalive";

/// Path on which the service delivers encrypted chat envelopes.
pub const INCOMING_MESSAGE_PATH: &str = "/api/v1/message";

/// Verb the service uses for chat envelope deliveries.
pub const INCOMING_MESSAGE_VERB: &str = "PUT";

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned by [`decode`] and [`decode_envelope`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The socket delivered a zero-length binary frame.
    #[error("empty frame")]
    Empty,
    /// The raw bytes could not be decoded as protobuf.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The frame is typed as a request or response but the matching payload is absent.
    #[error("{0:?} frame carries no payload")]
    MissingPayload(MessageType),
}

// =============================================================================
// MESSAGE TYPE
// =============================================================================

/// Discriminator of a [`Message`] on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Unknown,
    /// Sent by either side, expects a response with the same id.
    Request,
    /// Answers a request by id.
    Response,
}

impl MessageType {
    /// Convert into the wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => WireType::Unknown as i32,
            Self::Request => WireType::Request as i32,
            Self::Response => WireType::Response as i32,
        }
    }

    /// Parse a wire enum integer value. Returns `None` for values outside the enum.
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match WireType::try_from(value) {
            Ok(WireType::Unknown) => Some(Self::Unknown),
            Ok(WireType::Request) => Some(Self::Request),
            Ok(WireType::Response) => Some(Self::Response),
            Err(_) => None,
        }
    }
}

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// A request frame. `id` correlates the peer's response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// HTTP-style verb, e.g. `"PUT"`.
    pub verb: String,
    pub path: String,
    pub body: Option<Vec<u8>>,
    /// Raw `name:value` header lines.
    pub headers: Vec<String>,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self { id, verb: verb.into(), path: path.into(), body: None, headers: Vec::new() }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.headers.push(header.into());
        self
    }

    /// True for the reserved `GET /v1/keepalive` request.
    #[must_use]
    pub fn is_keepalive(&self) -> bool {
        self.verb == KEEPALIVE_VERB && self.path == KEEPALIVE_PATH
    }

    /// True for any request on the chat delivery path, whatever its verb.
    #[must_use]
    pub fn is_incoming_message(&self) -> bool {
        self.path == INCOMING_MESSAGE_PATH
    }

    /// True when the request delivers an encrypted chat envelope: `PUT /api/v1/message`.
    #[must_use]
    pub fn is_chat_delivery(&self) -> bool {
        self.verb.eq_ignore_ascii_case(INCOMING_MESSAGE_VERB) && self.is_incoming_message()
    }

    /// Look up a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Body as UTF-8 text (lossy). `None` when absent or blank.
    #[must_use]
    pub fn body_text(&self) -> Option<String> {
        body_text(self.body.as_deref())
    }
}

/// A response frame answering the request with the same `id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: u32,
    /// Status reason phrase, e.g. `"OK"`.
    pub message: String,
    pub body: Option<Vec<u8>>,
    pub headers: Vec<String>,
}

impl Response {
    #[must_use]
    pub fn new(id: u64, status: u32, message: impl Into<String>) -> Self {
        Self { id, status, message: message.into(), body: None, headers: Vec::new() }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Body as UTF-8 text (lossy). `None` when absent or blank.
    #[must_use]
    pub fn body_text(&self) -> Option<String> {
        body_text(self.body.as_deref())
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A decoded websocket frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    /// A keepalive request, usually the peer's echo of ours. Carries no work.
    Keepalive(Request),
    /// A frame whose type is not understood; kept so callers can log it.
    Unknown { wire_type: i32 },
}

impl Message {
    /// Raw wire type integer: 1 for requests (keepalives included), 2 for responses.
    #[must_use]
    pub fn wire_type(&self) -> i32 {
        match self {
            Self::Request(_) | Self::Keepalive(_) => MessageType::Request.as_i32(),
            Self::Response(_) => MessageType::Response.as_i32(),
            Self::Unknown { wire_type } => *wire_type,
        }
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        MessageType::from_i32(self.wire_type()).unwrap_or(MessageType::Unknown)
    }

    /// Request or response id, if the frame has one.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Request(request) | Self::Keepalive(request) => Some(request.id),
            Self::Response(response) => Some(response.id),
            Self::Unknown { .. } => None,
        }
    }

    /// Keepalives are low-priority control traffic with nothing to dispatch.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Keepalive(_))
    }
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Encode a request frame. Identical arguments always produce identical bytes.
#[must_use]
pub fn prepare_request(
    id: u64,
    verb: &str,
    path: &str,
    body: Option<&str>,
    headers: &[String],
) -> Vec<u8> {
    let request = Request {
        id,
        verb: verb.to_owned(),
        path: path.to_owned(),
        body: body.map(|b| b.as_bytes().to_vec()),
        headers: headers.to_vec(),
    };
    encode(&Message::Request(request))
}

/// Encode a response frame answering request `id`.
#[must_use]
pub fn prepare_response(
    id: u64,
    status: u32,
    message: &str,
    body: Option<&str>,
    headers: &[String],
) -> Vec<u8> {
    let response = Response {
        id,
        status,
        message: message.to_owned(),
        body: body.map(|b| b.as_bytes().to_vec()),
        headers: headers.to_vec(),
    };
    encode(&Message::Response(response))
}

/// Encode any message into protobuf bytes.
#[must_use]
pub fn encode(message: &Message) -> Vec<u8> {
    message_to_wire(message).encode_to_vec()
}

/// Decode protobuf bytes into a message.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for zero-length input, [`CodecError::Decode`]
/// for malformed bytes and [`CodecError::MissingPayload`] when a typed frame
/// lacks its request/response body. Unknown type numbers are not an error.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let wire = WireMessage::decode(bytes)?;
    wire_to_message(wire)
}

fn message_to_wire(message: &Message) -> WireMessage {
    match message {
        Message::Request(request) | Message::Keepalive(request) => WireMessage {
            kind: Some(WireType::Request as i32),
            request: Some(WireRequest {
                verb: Some(request.verb.clone()),
                path: Some(request.path.clone()),
                body: request.body.clone(),
                id: Some(request.id),
                headers: request.headers.clone(),
            }),
            response: None,
        },
        Message::Response(response) => WireMessage {
            kind: Some(WireType::Response as i32),
            request: None,
            response: Some(WireResponse {
                id: Some(response.id),
                status: Some(response.status),
                message: Some(response.message.clone()),
                body: response.body.clone(),
                headers: response.headers.clone(),
            }),
        },
        Message::Unknown { wire_type } => WireMessage { kind: Some(*wire_type), request: None, response: None },
    }
}

fn wire_to_message(wire: WireMessage) -> Result<Message, CodecError> {
    let wire_type = wire.kind.unwrap_or(WireType::Unknown as i32);
    match MessageType::from_i32(wire_type) {
        Some(MessageType::Request) => {
            let wire_request = wire.request.ok_or(CodecError::MissingPayload(MessageType::Request))?;
            let request = Request {
                id: wire_request.id.unwrap_or_default(),
                verb: wire_request.verb.unwrap_or_default(),
                path: wire_request.path.unwrap_or_default(),
                body: wire_request.body,
                headers: wire_request.headers,
            };
            if request.is_keepalive() {
                Ok(Message::Keepalive(request))
            } else {
                Ok(Message::Request(request))
            }
        }
        Some(MessageType::Response) => {
            let wire_response = wire.response.ok_or(CodecError::MissingPayload(MessageType::Response))?;
            Ok(Message::Response(Response {
                id: wire_response.id.unwrap_or_default(),
                status: wire_response.status.unwrap_or_default(),
                message: wire_response.message.unwrap_or_default(),
                body: wire_response.body,
                headers: wire_response.headers,
            }))
        }
        Some(MessageType::Unknown) | None => Ok(Message::Unknown { wire_type }),
    }
}

fn find_header<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
    headers.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn body_text(body: Option<&[u8]>) -> Option<String> {
    let text = String::from_utf8_lossy(body?);
    if text.trim().is_empty() {
        return None;
    }
    Some(text.into_owned())
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Kind of a decrypted chat envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    #[default]
    Unknown,
    Ciphertext,
    KeyExchange,
    PrekeyBundle,
    Receipt,
    UnidentifiedSender,
}

impl EnvelopeType {
    fn from_i32(value: i32) -> Self {
        match WireEnvelopeType::try_from(value) {
            Ok(WireEnvelopeType::Ciphertext) => Self::Ciphertext,
            Ok(WireEnvelopeType::KeyExchange) => Self::KeyExchange,
            Ok(WireEnvelopeType::PrekeyBundle) => Self::PrekeyBundle,
            Ok(WireEnvelopeType::Receipt) => Self::Receipt,
            Ok(WireEnvelopeType::UnidentifiedSender) => Self::UnidentifiedSender,
            Ok(WireEnvelopeType::Unknown) | Err(_) => Self::Unknown,
        }
    }

    fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => WireEnvelopeType::Unknown as i32,
            Self::Ciphertext => WireEnvelopeType::Ciphertext as i32,
            Self::KeyExchange => WireEnvelopeType::KeyExchange as i32,
            Self::PrekeyBundle => WireEnvelopeType::PrekeyBundle as i32,
            Self::Receipt => WireEnvelopeType::Receipt as i32,
            Self::UnidentifiedSender => WireEnvelopeType::UnidentifiedSender as i32,
        }
    }
}

/// Decrypted envelope of an incoming chat message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    /// Sender username.
    pub source: Option<String>,
    pub source_device: Option<u32>,
    pub relay: Option<String>,
    /// Sender timestamp in milliseconds.
    pub timestamp: Option<u64>,
    pub legacy_message: Option<Vec<u8>>,
    pub content: Option<Vec<u8>>,
    pub server_guid: Option<String>,
    pub server_timestamp: Option<u64>,
}

/// Encode an envelope into protobuf bytes.
#[must_use]
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    WireEnvelope {
        kind: Some(envelope.envelope_type.as_i32()),
        source: envelope.source.clone(),
        relay: envelope.relay.clone(),
        timestamp: envelope.timestamp,
        legacy_message: envelope.legacy_message.clone(),
        source_device: envelope.source_device,
        content: envelope.content.clone(),
        server_guid: envelope.server_guid.clone(),
        server_timestamp: envelope.server_timestamp,
    }
    .encode_to_vec()
}

/// Decode decrypted envelope bytes.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] or [`CodecError::Decode`].
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let wire = WireEnvelope::decode(bytes)?;
    Ok(Envelope {
        envelope_type: EnvelopeType::from_i32(wire.kind.unwrap_or_default()),
        source: wire.source,
        source_device: wire.source_device,
        relay: wire.relay,
        timestamp: wire.timestamp,
        legacy_message: wire.legacy_message,
        content: wire.content,
        server_guid: wire.server_guid,
        server_timestamp: wire.server_timestamp,
    })
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Clone, PartialEq, prost::Message)]
struct WireMessage {
    #[prost(enumeration = "WireType", optional, tag = "1")]
    kind: Option<i32>,
    #[prost(message, optional, tag = "2")]
    request: Option<WireRequest>,
    #[prost(message, optional, tag = "3")]
    response: Option<WireResponse>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireRequest {
    #[prost(string, optional, tag = "1")]
    verb: Option<String>,
    #[prost(string, optional, tag = "2")]
    path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    body: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "4")]
    id: Option<u64>,
    #[prost(string, repeated, tag = "5")]
    headers: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireResponse {
    #[prost(uint64, optional, tag = "1")]
    id: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    status: Option<u32>,
    #[prost(string, optional, tag = "3")]
    message: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    body: Option<Vec<u8>>,
    #[prost(string, repeated, tag = "5")]
    headers: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireType {
    Unknown = 0,
    Request = 1,
    Response = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireEnvelope {
    #[prost(enumeration = "WireEnvelopeType", optional, tag = "1")]
    kind: Option<i32>,
    #[prost(string, optional, tag = "2")]
    source: Option<String>,
    #[prost(string, optional, tag = "3")]
    relay: Option<String>,
    #[prost(uint64, optional, tag = "5")]
    timestamp: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "6")]
    legacy_message: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "7")]
    source_device: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "8")]
    content: Option<Vec<u8>>,
    #[prost(string, optional, tag = "9")]
    server_guid: Option<String>,
    #[prost(uint64, optional, tag = "10")]
    server_timestamp: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireEnvelopeType {
    Unknown = 0,
    Ciphertext = 1,
    KeyExchange = 2,
    PrekeyBundle = 3,
    Receipt = 5,
    UnidentifiedSender = 6,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
