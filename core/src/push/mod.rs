/// Push channel: optional low-latency delivery over STOMP/WebSocket
pub mod channel;
pub mod frame;

pub use channel::{PushChannel, PushMessageHandler, ReadReceiptHandler};
pub use frame::{Command, StompFrame};

/// Topic names used by the chat backend's message broker
pub mod destinations {
    use crate::types::{ConversationId, UserId};

    /// Shared application-level send destination
    pub const SEND: &str = "/app/chat.send";
    /// Read-receipt publish destination
    pub const READ: &str = "/app/chat.read";

    pub fn user_messages(user_id: UserId) -> String {
        format!("/user/{}/queue/messages", user_id)
    }

    pub fn user_read_receipts(user_id: UserId) -> String {
        format!("/user/{}/queue/read-receipts", user_id)
    }

    pub fn conversation(conversation_id: &ConversationId) -> String {
        format!("/topic/conversation.{}", conversation_id)
    }
}
