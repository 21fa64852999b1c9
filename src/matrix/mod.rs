//! # Matrix Chat Side
//!
//! The relay does not log in, sync or decrypt; an embedding application owns
//! the Matrix session and implements [`ChatClient`] for it. Incoming room
//! events are handed to the relay as [`ChatMessage`] values and outgoing
//! content is built as [`ChatContent`].
//!
//! Every message the relay posts carries `meshtastic_*` metadata fields so a
//! peer relay in the same room can tell which meshnet it came from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("room send failed: {0}")]
    Send(String),
    #[error("not joined to room {0}")]
    NotJoined(String),
    #[error("chat request timed out")]
    Timeout,
}

/// Relay metadata attached to Matrix content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetadata {
    #[serde(rename = "meshtastic_longname", default)]
    pub longname: String,
    #[serde(rename = "meshtastic_shortname", default)]
    pub shortname: String,
    #[serde(rename = "meshtastic_meshnet", default)]
    pub meshnet: String,
    #[serde(rename = "meshtastic_portnum", default, skip_serializing_if = "Option::is_none")]
    pub portnum: Option<String>,
    #[serde(rename = "meshtastic_id", default, skip_serializing_if = "Option::is_none")]
    pub mesh_id: Option<u32>,
    #[serde(rename = "meshtastic_replyId", default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<u32>,
    #[serde(rename = "meshtastic_text", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "meshtastic_emoji", default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "m.text")]
    Text,
    #[serde(rename = "m.notice")]
    Notice,
    #[serde(rename = "m.emote")]
    Emote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(rename = "m.in_reply_to")]
    pub in_reply_to: InReplyTo,
}

/// Content of an `m.room.message` the relay posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContent {
    pub msgtype: MessageType,
    pub body: String,
    #[serde(flatten)]
    pub meta: RelayMetadata,
    #[serde(rename = "m.relates_to", default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<RelatesTo>,
}

impl ChatContent {
    pub fn new(msgtype: MessageType, body: impl Into<String>, meta: RelayMetadata) -> Self {
        Self {
            msgtype,
            body: body.into(),
            meta,
            relates_to: None,
        }
    }

    pub fn in_reply_to(mut self, event_id: impl Into<String>) -> Self {
        self.relates_to = Some(RelatesTo {
            in_reply_to: InReplyTo {
                event_id: event_id.into(),
            },
        });
        self
    }

    pub fn reply_target(&self) -> Option<&str> {
        self.relates_to.as_ref().map(|r| r.in_reply_to.event_id.as_str())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEventKind {
    Text,
    Notice,
    Emote,
    /// `m.reaction` annotating `target_event`.
    Reaction { key: String, target_event: String },
}

/// An event observed in a mapped room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub kind: ChatEventKind,
    pub in_reply_to: Option<String>,
    /// Present when the event was posted by a relay.
    pub relay_meta: Option<RelayMetadata>,
    /// `mmrelay_suppress` set by the sender; never relayed.
    pub suppress: bool,
}

impl ChatMessage {
    pub fn text(event_id: &str, room_id: &str, sender: &str, timestamp: DateTime<Utc>, body: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            timestamp,
            body: body.to_string(),
            kind: ChatEventKind::Text,
            in_reply_to: None,
            relay_meta: None,
            suppress: false,
        }
    }

    pub fn reaction(
        event_id: &str,
        room_id: &str,
        sender: &str,
        timestamp: DateTime<Utc>,
        key: &str,
        target_event: &str,
    ) -> Self {
        Self {
            kind: ChatEventKind::Reaction {
                key: key.to_string(),
                target_event: target_event.to_string(),
            },
            ..Self::text(event_id, room_id, sender, timestamp, "")
        }
    }

    pub fn replying_to(mut self, event_id: &str) -> Self {
        self.in_reply_to = Some(event_id.to_string());
        self
    }

    pub fn with_relay_meta(mut self, meta: RelayMetadata) -> Self {
        self.relay_meta = Some(meta);
        self
    }
}

/// The Matrix session as the relay sees it.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Fully qualified bot id, e.g. `@relay:example.org`.
    fn user_id(&self) -> &str;

    /// Bot display name, used to recognise `Name: !command` mentions.
    fn bot_name(&self) -> Option<String> {
        None
    }

    /// Post content and return the new event id.
    async fn room_send(&self, room_id: &str, content: ChatContent) -> Result<String, ChatError>;

    /// Room-specific display name, falling back to the global one.
    async fn display_name(&self, room_id: &str, user_id: &str) -> Option<String>;

    async fn join_room(&self, room_id: &str) -> Result<(), ChatError>;
}
