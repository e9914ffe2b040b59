use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);

/// Identity of a log entry.
///
/// Server-assigned ids and client correlation ids live in disjoint namespaces,
/// so a local id can never be mistaken for a persisted one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(String),
    Local(String),
}

impl MessageId {
    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Server(id) | MessageId::Local(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{id}"),
            MessageId::Local(id) => write!(f, "local:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Acknowledged,
    Failed,
}

pub const TEXT_MESSAGE_TYPE: &str = "txt";

/// A message as the server serializes it, both in pushes, acks and history
/// pages. Field casing is not stable across server versions, hence the aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    #[serde(
        default,
        alias = "clientID",
        alias = "clientId",
        alias = "clientid",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_string_as_none"
    )]
    pub client_id: Option<String>,
    #[serde(alias = "conversationID", alias = "conversationId", alias = "conversationid")]
    pub conversation_id: ConversationId,
    #[serde(alias = "senderID", alias = "senderId", alias = "senderid")]
    pub sender_id: UserId,
    #[serde(
        default = "default_message_type",
        alias = "messageType",
        alias = "messagetype"
    )]
    pub message_type: String,
    #[serde(default, deserialize_with = "content_from_any")]
    pub content: String,
    #[serde(default, alias = "isRead", alias = "isread")]
    pub is_read: bool,
    /// Missing or unparseable on some acks; consumers keep their own time then.
    #[serde(
        default,
        alias = "createdAt",
        alias = "createdat",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_message_type() -> String {
    TEXT_MESSAGE_TYPE.to_string()
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()))
}

/// Content is typed loosely on the server; anything that is not a string is
/// kept as its JSON text.
fn content_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Empty or malformed timestamp strings decode as `None`, e.g. conversations
/// without messages.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }))
}

/// One entry of a conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

impl Message {
    pub fn pending(
        correlation_id: impl Into<String>,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::Local(correlation_id.into()),
            conversation_id,
            sender_id,
            content: content.into(),
            message_type: TEXT_MESSAGE_TYPE.to_string(),
            is_read: false,
            created_at,
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }
}

impl From<WireMessage> for Message {
    fn from(value: WireMessage) -> Self {
        Self {
            id: MessageId::Server(value.id),
            conversation_id: value.conversation_id,
            sender_id: value.sender_id,
            content: value.content,
            message_type: value.message_type,
            is_read: value.is_read,
            created_at: value.created_at.unwrap_or_else(Utc::now),
            delivery_state: DeliveryState::Acknowledged,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub participant_id: Option<UserId>,
    #[serde(alias = "participant")]
    pub participant_name: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_message_at: Option<DateTime<Utc>>,
}
