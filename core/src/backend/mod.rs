/// Backend collaborator: the REST API that owns message storage
pub mod http;

use crate::error::Result;
use crate::types::{Conversation, ConversationId, Message, MessageId, NewMessage, UserId};
use async_trait::async_trait;

pub use http::HttpBackend;

/// Logical operations consumed from the backend.
///
/// Pagination and transport retries belong to implementations; the sync core
/// treats every call as one logical operation.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Current message list of a conversation, newest-inclusive
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: Option<u32>,
        size: Option<u32>,
    ) -> Result<Vec<Message>>;

    /// Persist a message; returns it with its assigned id and canonical timestamp
    async fn send_message(&self, message: &NewMessage) -> Result<Message>;

    async fn mark_read(&self, message_id: MessageId) -> Result<()>;

    async fn mark_all_read(&self, conversation_id: &ConversationId, user_id: UserId) -> Result<()>;

    async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation>;
}
