/// ChatSync - client-side message synchronization
/// 
/// Incremental polling with backoff, an optional STOMP/WebSocket push
/// channel, identity-based de-duplication and read-receipt propagation for a
/// REST chat backend.

pub mod error;
pub mod config;
pub mod types;
pub mod timestamp;
pub mod backend;
pub mod fetcher;
pub mod backoff;
pub mod poller;
pub mod dedup;
pub mod push;
pub mod service;

pub use error::{Result, SyncError};
pub use config::Config;
pub use service::{MessagingService, SyncHandle};
pub use types::{Conversation, ConversationId, Message, NewMessage};
