//! Inbound frame handling shared by every connection.
//!
//! Server-initiated requests are acknowledged with `200 OK` as soon as they
//! arrive, except chat deliveries on `/api/v1/message`: those are
//! acknowledged by the caller once the message is stored
//! (`Connection::ack`). Chat deliveries carry an encrypted envelope that is
//! opened through an injected [`BodyDecryptor`].

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use frames::{Envelope, Message, Request};
use serde::Serialize;

use crate::inbox::PendingMessage;

/// Tag assumed for deliveries that carry no `tag:` header.
pub const DEFAULT_TAG: &str = "chat";

/// Request header naming the feature a delivery belongs to (`chat`, `tx-note`).
pub const TAG_HEADER: &str = "tag";

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    /// The decryptor rejected the ciphertext.
    #[error("decryption failed: {0}")]
    Decrypt(String),
    /// The decryptor returned plaintext that is not valid base64.
    #[error("invalid base64 plaintext: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The plaintext is not a valid envelope.
    #[error("invalid envelope: {0}")]
    Envelope(#[from] frames::CodecError),
}

/// Opens encrypted chat bodies. Implemented by the signal-protocol session layer.
#[async_trait]
pub trait BodyDecryptor: Send + Sync {
    /// Decrypt a base64 ciphertext body, returning the base64 envelope plaintext.
    async fn decrypt(&self, body_b64: &str) -> Result<String, InboundError>;
}

/// What message hooks receive: the decoded frame plus, for chat deliveries,
/// the opened envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Incoming {
    pub message: Message,
    pub envelope: Option<Envelope>,
}

impl Incoming {
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self { message, envelope: None }
    }

    /// Raw wire type: 1 request, 2 response.
    #[must_use]
    pub fn wire_type(&self) -> i32 {
        self.message.wire_type()
    }

    #[must_use]
    pub fn body_text(&self) -> Option<String> {
        match &self.message {
            Message::Request(request) | Message::Keepalive(request) => request.body_text(),
            Message::Response(response) => response.body_text(),
            Message::Unknown { .. } => None,
        }
    }

    /// Inbox record for a delivered chat message whose envelope names a sender.
    #[must_use]
    pub fn pending_message(&self) -> Option<PendingMessage> {
        let Message::Request(request) = &self.message else {
            return None;
        };
        if !request.is_chat_delivery() {
            return None;
        }
        let envelope = self.envelope.as_ref()?;
        let source = envelope.source.clone().filter(|s| !s.is_empty())?;
        Some(PendingMessage {
            source,
            timestamp: envelope.timestamp.or(envelope.server_timestamp).unwrap_or_default(),
            tag: request.header(TAG_HEADER).unwrap_or(DEFAULT_TAG).to_owned(),
            request_id: Some(request.id),
        })
    }
}

/// Id to acknowledge immediately, for server requests other than chat deliveries.
#[must_use]
pub fn auto_ack_id(message: &Message) -> Option<u64> {
    match message {
        Message::Request(request) if !request.is_incoming_message() => Some(request.id),
        _ => None,
    }
}

/// Decrypt and decode the envelope carried by a chat delivery.
///
/// Returns `Ok(None)` when the request has no body or the plaintext is empty.
///
/// # Errors
///
/// Returns decryption, base64 or envelope decoding failures.
pub async fn open_envelope(
    decryptor: &dyn BodyDecryptor,
    request: &Request,
) -> Result<Option<Envelope>, InboundError> {
    let Some(body) = request.body.as_deref().filter(|b| !b.is_empty()) else {
        return Ok(None);
    };
    let plaintext_b64 = decryptor.decrypt(&STANDARD.encode(body)).await?;
    let plaintext = STANDARD.decode(plaintext_b64.trim())?;
    if plaintext.is_empty() {
        return Ok(None);
    }
    Ok(Some(frames::decode_envelope(&plaintext)?))
}

#[cfg(test)]
#[path = "inbound_test.rs"]
mod tests;
