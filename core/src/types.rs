/// Shared types for the sync layer
use crate::error::{Result, SyncError};
use crate::timestamp::{self, Timestamp};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

pub type MessageId = i64;
pub type UserId = i64;

/// Opaque conversation identifier. Backends send either numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Caller-error check performed before any network call
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(SyncError::Validation(
                "conversation id is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<i64> for ConversationId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for ConversationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Self::new(s)),
            Value::Number(n) => Ok(Self(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "conversation id must be a string or number, got {}",
                other
            ))),
        }
    }
}

/// A chat message as seen by the sync core
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Backend-assigned id; `None` until the backend acknowledged the message
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub content: String,
    pub timestamp: Timestamp,
    pub read: bool,
}

impl Message {
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }
}

/// Lenient wire shape; field names vary between backend endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default, alias = "messageId")]
    id: Option<Value>,
    #[serde(default, alias = "chatId")]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    sender_id: Option<Value>,
    #[serde(default)]
    receiver_id: Option<Value>,
    #[serde(default, alias = "text", alias = "message")]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    sent_at: Option<Value>,
    #[serde(default, alias = "isRead")]
    read: Option<bool>,
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawMessage::deserialize(deserializer)?;
        let timestamp = timestamp::normalize_first(&[
            raw.timestamp.as_ref(),
            raw.created_at.as_ref(),
            raw.sent_at.as_ref(),
        ]);
        Ok(Message {
            id: raw.id.as_ref().and_then(id_value).filter(|id| *id != 0),
            conversation_id: raw.conversation_id.unwrap_or_else(|| ConversationId::new("")),
            sender_id: raw.sender_id.as_ref().and_then(id_value).unwrap_or_default(),
            receiver_id: raw.receiver_id.as_ref().and_then(id_value),
            content: raw.content.unwrap_or_default(),
            timestamp,
            read: raw.read.unwrap_or(false),
        })
    }
}

/// Accept ids sent as numbers or numeric strings
pub(crate) fn id_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Conversation metadata owned by the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub last_message_at: Option<Timestamp>,
}

impl Conversation {
    /// Minimal stand-in returned when the backend cannot be reached
    pub fn stub(id: ConversationId) -> Self {
        Self {
            id,
            participants: Vec::new(),
            last_message_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConversation {
    id: ConversationId,
    #[serde(default, alias = "participantIds")]
    participants: Vec<Value>,
    #[serde(default)]
    student_id: Option<Value>,
    #[serde(default)]
    tutor_id: Option<Value>,
    #[serde(default, alias = "lastMessageTime", alias = "updatedAt")]
    last_message_at: Option<Value>,
}

impl<'de> Deserialize<'de> for Conversation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawConversation::deserialize(deserializer)?;
        let mut participants: Vec<UserId> = raw
            .participants
            .iter()
            .filter_map(|p| match p {
                Value::Object(obj) => obj.get("id").and_then(id_value),
                other => id_value(other),
            })
            .collect();
        for extra in [raw.student_id.as_ref(), raw.tutor_id.as_ref()] {
            if let Some(id) = extra.and_then(id_value) {
                if !participants.contains(&id) {
                    participants.push(id);
                }
            }
        }
        Ok(Conversation {
            id: raw.id,
            participants,
            last_message_at: raw
                .last_message_at
                .as_ref()
                .filter(|v| !v.is_null())
                .map(timestamp::normalize),
        })
    }
}

/// A message the user wants to send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub content: String,
}

impl NewMessage {
    pub fn new(conversation_id: impl Into<ConversationId>, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: Some(sender_id),
            receiver_id: None,
            content: content.into(),
        }
    }

    pub fn to(mut self, receiver_id: UserId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    /// Reject sends with missing required fields before any network call
    pub fn validate(&self) -> Result<()> {
        self.conversation_id.validate()?;
        if self.sender_id.is_none() {
            return Err(SyncError::Validation("sender id is required".to_string()));
        }
        if self.content.trim().is_empty() {
            return Err(SyncError::Validation("message content is required".to_string()));
        }
        Ok(())
    }
}

/// Read-receipt event carried by the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

/// Events surfaced to the embedding application
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// New messages merged into a conversation
    NewMessages {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    /// A message was marked read
    MessageRead { message_id: MessageId },
    /// Push channel came up
    PushConnected,
    /// Push channel reported a problem
    PushError { reason: String },
}
