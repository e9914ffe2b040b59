use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{ConversationId, ConversationSummary, WireMessage};

pub const EVENT_CONVERSATION_JOIN: &str = "conversation:join";
pub const EVENT_CONVERSATION_LEAVE: &str = "conversation:leave";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_MESSAGE_NEW: &str = "message:new";
pub const EVENT_MESSAGE_ACK: &str = "message:ack";
pub const EVENT_SERVER_MESSAGE: &str = "server:message";

pub const CHAT_MESSAGE_KIND: &str = "chat_message";

/// The canonical wire unit, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// User intents the client can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    ChatMessage {
        client_id: String,
        conversation_id: ConversationId,
        content: String,
        message_type: String,
    },
}

impl OutboundCommand {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundCommand::JoinConversation { .. } => EVENT_CONVERSATION_JOIN,
            OutboundCommand::LeaveConversation { .. } => EVENT_CONVERSATION_LEAVE,
            OutboundCommand::ChatMessage { .. } => EVENT_MESSAGE,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            OutboundCommand::JoinConversation { conversation_id }
            | OutboundCommand::LeaveConversation { conversation_id }
            | OutboundCommand::ChatMessage {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        let event = self.event_name();
        let data = match self {
            OutboundCommand::JoinConversation { conversation_id }
            | OutboundCommand::LeaveConversation { conversation_id } => {
                json!({ "conversation_id": conversation_id })
            }
            OutboundCommand::ChatMessage {
                client_id,
                conversation_id,
                content,
                message_type,
            } => json!({
                "client_id": client_id,
                "type": CHAT_MESSAGE_KIND,
                "conversation_id": conversation_id,
                "content": content,
                "message_type": message_type,
            }),
        };
        Envelope::new(event, data)
    }
}

/// Every REST response is wrapped as `{success, data}` or `{success, error}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// One page of conversation history, newest page first on the server side.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryPage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub meta: PageMeta,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<WireMessage>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<WireMessage>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Query for a history page; an empty request asks for the latest page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn after(meta: &PageMeta) -> Option<Self> {
        if !meta.has_more {
            return None;
        }
        Some(Self {
            timestamp: meta.timestamp.clone(),
            cursor: meta.cursor.clone(),
        })
    }
}

pub type ConversationList = Vec<ConversationSummary>;
