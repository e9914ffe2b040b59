use shared::{
    domain::{ConversationId, TEXT_MESSAGE_TYPE},
    protocol::{Envelope, OutboundCommand},
};
use tracing::debug;

use crate::transport::CommandTransport;

pub fn join(conversation_id: &ConversationId) -> OutboundCommand {
    OutboundCommand::JoinConversation {
        conversation_id: conversation_id.clone(),
    }
}

pub fn leave(conversation_id: &ConversationId) -> OutboundCommand {
    OutboundCommand::LeaveConversation {
        conversation_id: conversation_id.clone(),
    }
}

pub fn chat_message(
    conversation_id: &ConversationId,
    client_id: &str,
    content: &str,
) -> OutboundCommand {
    OutboundCommand::ChatMessage {
        client_id: client_id.to_string(),
        conversation_id: conversation_id.clone(),
        content: content.to_string(),
        message_type: TEXT_MESSAGE_TYPE.to_string(),
    }
}

pub fn encode(command: OutboundCommand) -> Envelope {
    command.into_envelope()
}

/// Encodes `command` and hands it to the transport. A `false` return means
/// the socket was not open; nothing is buffered.
pub fn send_command(transport: &dyn CommandTransport, command: OutboundCommand) -> bool {
    let event = command.event_name();
    let conversation_id = command.conversation_id().clone();
    let sent = transport.send(&encode(command));
    if !sent {
        debug!(event, conversation_id = %conversation_id, "command not sent: transport not open");
    }
    sent
}
