//! Chat list aggregation.
//!
//! The chat list shown to the user merges three sources: chats stored by the
//! chat client, unread counters reported by the server, and deliveries that
//! already arrived over the websocket but were not yet read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A chat delivery received over the websocket and not yet consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    /// Sender username.
    pub source: String,
    /// Sender timestamp in milliseconds.
    pub timestamp: u64,
    /// Feature the delivery belongs to, e.g. `chat`.
    pub tag: String,
    /// Id of the server request that carried it; acked once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadEntry {
    pub count: u32,
    /// Timestamp of the newest unread message.
    pub latest: u64,
}

/// Unread counters keyed by sender username.
pub type UnreadMap = BTreeMap<String, UnreadEntry>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub device: u32,
    #[serde(default)]
    pub server_timestamp: u64,
    #[serde(default)]
    pub saved_timestamp: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread: u32,
}

impl ChatSummary {
    /// Placeholder for a sender with unread messages but no stored chat.
    #[must_use]
    pub fn placeholder(username: &str, entry: UnreadEntry) -> Self {
        Self {
            username: username.to_owned(),
            last_message: Some(LastMessage {
                content: String::new(),
                username: username.to_owned(),
                device: 1,
                server_timestamp: entry.latest,
                saved_timestamp: 0,
            }),
            unread: entry.count,
        }
    }

    fn is_listable(&self) -> bool {
        self.last_message.is_some() && !self.username.is_empty()
    }
}

/// Fold websocket deliveries carrying `tag` into the unread counters.
///
/// A sender seen for the first time starts at one. A known sender is only
/// bumped by a delivery newer than its latest unread message, so a delivery
/// the server already counted is not counted twice.
#[must_use]
pub fn tally_unread(mut unread: UnreadMap, received: &[PendingMessage], tag: &str) -> UnreadMap {
    for message in received.iter().filter(|m| m.tag == tag) {
        match unread.get_mut(&message.source) {
            None => {
                unread.insert(message.source.clone(), UnreadEntry { count: 1, latest: message.timestamp });
            }
            Some(entry) if entry.latest < message.timestamp => {
                entry.count += 1;
                entry.latest = message.timestamp;
            }
            Some(_) => {}
        }
    }
    unread
}

/// Build the chat list: placeholders for unread senders without a stored
/// chat come first (ordered by username), then the stored chats in their
/// original order. Stored chats without a last message or username are
/// dropped.
#[must_use]
pub fn merge_chats(unread: &UnreadMap, existing: Vec<ChatSummary>) -> Vec<ChatSummary> {
    let existing: Vec<ChatSummary> = existing.into_iter().filter(ChatSummary::is_listable).collect();

    let mut merged: Vec<ChatSummary> = unread
        .iter()
        .filter(|(username, _)| !existing.iter().any(|chat| &chat.username == *username))
        .map(|(username, entry)| ChatSummary::placeholder(username, *entry))
        .collect();
    merged.extend(existing);

    for chat in &mut merged {
        let entry = unread.get(&chat.username);
        chat.unread = entry.map_or(0, |e| e.count);
        if let (Some(entry), Some(last)) = (entry, chat.last_message.as_mut()) {
            last.server_timestamp = entry.latest;
        }
    }
    merged
}

#[cfg(test)]
#[path = "inbox_test.rs"]
mod tests;
