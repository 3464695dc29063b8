//! Typed access to the chat client.
//!
//! The chat client (account registration, signal sessions, message storage)
//! is provided by the host application behind [`ChatClient`]. Its calls
//! return JSON strings; [`ChatService`] parses them into typed values.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Credentials;
use crate::error::ErrorCode;
use crate::inbound::DEFAULT_TAG;
use crate::inbox::{self, ChatSummary, PendingMessage, UnreadMap};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The chat client rejected the call.
    #[error("chat client failed: {0}")]
    Client(String),
    #[error("invalid chat payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Client(_) => "E_CHAT_CLIENT",
            Self::Payload(_) => "E_CHAT_PAYLOAD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Client(_))
    }
}

/// Parameters for adding a contact to the chat client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactParams {
    pub username: String,
    pub user_id: Option<String>,
    pub target_user_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Recipient username.
    pub username: String,
    pub message: String,
}

/// One stored message in a conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub server_timestamp: u64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UnreadPayload {
    #[serde(default)]
    unread: UnreadMap,
}

#[derive(Debug, Default, Deserialize)]
struct NewMessagesPayload {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

/// Chat client provided by the host application. Every call returns a JSON
/// payload (possibly empty).
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn init(&self, credentials: &Credentials) -> Result<String, ChatError>;
    async fn register_account(&self) -> Result<String, ChatError>;
    async fn set_fcm_id(&self, token: &str) -> Result<String, ChatError>;
    async fn get_existing_chats(&self, tag: &str) -> Result<String, ChatError>;
    async fn get_unread_messages_count(&self, tag: &str) -> Result<String, ChatError>;
    async fn send_message_by_contact(&self, tag: &str, message: &OutgoingMessage) -> Result<String, ChatError>;
    async fn add_contact(&self, contact: &ContactParams, send_invite: bool) -> Result<String, ChatError>;
    async fn receive_new_messages_by_contact(&self, username: &str, tag: &str) -> Result<String, ChatError>;
    async fn get_chat_by_contact(&self, username: &str, tag: &str) -> Result<String, ChatError>;
}

#[derive(Clone)]
pub struct ChatService {
    client: Arc<dyn ChatClient>,
}

impl ChatService {
    #[must_use]
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ChatClient> {
        &self.client
    }

    /// # Errors
    ///
    /// Returns the client's failure.
    pub async fn init(&self, credentials: &Credentials) -> Result<(), ChatError> {
        self.client.init(credentials).await.map(drop)
    }

    /// # Errors
    ///
    /// Returns the client's failure.
    pub async fn register_account(&self) -> Result<(), ChatError> {
        self.client.register_account().await.map(drop)
    }

    /// # Errors
    ///
    /// Returns the client's failure.
    pub async fn set_fcm_id(&self, token: &str) -> Result<(), ChatError> {
        self.client.set_fcm_id(token).await.map(drop)
    }

    /// Chats stored locally by the client for `tag`.
    ///
    /// # Errors
    ///
    /// Returns the client's failure or an unparseable payload.
    pub async fn existing_chats(&self, tag: &str) -> Result<Vec<ChatSummary>, ChatError> {
        parse(&self.client.get_existing_chats(tag).await?)
    }

    /// Server-side unread counters keyed by sender.
    ///
    /// # Errors
    ///
    /// Returns the client's failure or an unparseable payload.
    pub async fn unread_counts(&self, tag: &str) -> Result<UnreadMap, ChatError> {
        let payload: UnreadPayload = parse(&self.client.get_unread_messages_count(tag).await?)?;
        Ok(payload.unread)
    }

    /// # Errors
    ///
    /// Returns the client's failure.
    pub async fn send_message(&self, tag: &str, message: &OutgoingMessage) -> Result<(), ChatError> {
        self.client.send_message_by_contact(tag, message).await.map(drop)
    }

    /// # Errors
    ///
    /// Returns the client's failure.
    pub async fn add_contact(&self, contact: &ContactParams, send_invite: bool) -> Result<(), ChatError> {
        self.client.add_contact(contact, send_invite).await.map(drop)
    }

    /// Fetch and store messages waiting on the server for one contact.
    ///
    /// # Errors
    ///
    /// Returns the client's failure or an unparseable payload.
    pub async fn receive_new_messages(&self, username: &str, tag: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let payload: NewMessagesPayload =
            parse(&self.client.receive_new_messages_by_contact(username, tag).await?)?;
        Ok(payload.messages)
    }

    /// Stored conversation with one contact, newest first.
    ///
    /// # Errors
    ///
    /// Returns the client's failure or an unparseable payload.
    pub async fn messages_by_contact(&self, username: &str, tag: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let mut messages: Vec<ChatMessage> = parse(&self.client.get_chat_by_contact(username, tag).await?)?;
        messages.sort_by(|a, b| b.server_timestamp.cmp(&a.server_timestamp));
        Ok(messages)
    }

    /// Chat list for the inbox. Unread counters are only fetched online.
    /// A failed client call contributes nothing instead of failing the list.
    pub async fn load_chats(&self, is_online: bool, received: &[PendingMessage]) -> Vec<ChatSummary> {
        let existing = self.existing_chats(DEFAULT_TAG).await.unwrap_or_else(|e| {
            warn!(error = %e, code = e.error_code(), "chat: existing chats unavailable");
            Vec::new()
        });

        let unread = if is_online {
            self.unread_counts(DEFAULT_TAG).await.unwrap_or_else(|e| {
                warn!(error = %e, code = e.error_code(), "chat: unread counts unavailable");
                UnreadMap::new()
            })
        } else {
            UnreadMap::new()
        };

        let unread = inbox::tally_unread(unread, received, DEFAULT_TAG);
        inbox::merge_chats(&unread, existing)
    }
}

/// Parse a client payload; an empty payload is the type's default.
fn parse<T: DeserializeOwned + Default>(payload: &str) -> Result<T, ChatError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
