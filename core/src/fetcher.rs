/// Incremental message fetch: backend list + client-side "newer than" filter
use crate::backend::Backend;
use crate::error::{Result, SyncError};
use crate::timestamp;
use crate::types::{ConversationId, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Fetcher {
    backend: Arc<dyn Backend>,
    fetch_timeout: Duration,
    page_size: u32,
}

impl Fetcher {
    pub fn new(backend: Arc<dyn Backend>, fetch_timeout: Duration, page_size: u32) -> Self {
        Self {
            backend,
            fetch_timeout,
            page_size,
        }
    }

    /// Messages strictly newer than `since` (epoch millis), in backend order.
    ///
    /// `since == None` returns the whole list. Messages whose timestamp could
    /// not be parsed are always kept. A call exceeding the fetch timeout fails
    /// with `SyncError::Timeout`.
    pub async fn fetch_since(
        &self,
        conversation_id: &ConversationId,
        since: Option<i64>,
    ) -> Result<Vec<Message>> {
        conversation_id.validate()?;

        let all = timeout(
            self.fetch_timeout,
            self.backend
                .fetch_messages(conversation_id, Some(0), Some(self.page_size)),
        )
        .await
        .map_err(|_| {
            SyncError::Timeout(format!(
                "fetch for conversation {} exceeded {:?}",
                conversation_id, self.fetch_timeout
            ))
        })??;

        let total = all.len();
        let fresh = filter_newer(all, since);
        debug!(
            "Conversation {}: {} of {} messages newer than {:?}",
            conversation_id,
            fresh.len(),
            total,
            since
        );
        Ok(fresh)
    }

    /// Non-failing form used by callers that only want "what's new".
    ///
    /// `since` is an ISO-8601 string; absent means "now" so a first call does
    /// not flood the caller with backlog. Failures are logged and yield an
    /// empty list.
    pub async fn fetch_new_messages(
        &self,
        conversation_id: &ConversationId,
        since: Option<&str>,
    ) -> Vec<Message> {
        let since = match since {
            Some(raw) => match timestamp::parse_str(raw) {
                Some(ms) => Some(ms),
                None => {
                    warn!("Unparseable since value {:?}, fetching unfiltered", raw);
                    None
                }
            },
            None => Some(timestamp::now_millis()),
        };

        match self.fetch_since(conversation_id, since).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Fetch failed for conversation {}: {}", conversation_id, e);
                Vec::new()
            }
        }
    }
}

/// Keep messages newer than `since`; unparseable timestamps are never dropped
pub fn filter_newer(messages: Vec<Message>, since: Option<i64>) -> Vec<Message> {
    let Some(since) = since else {
        return messages;
    };
    messages
        .into_iter()
        .filter(|m| match m.timestamp.cursor_value() {
            Some(ts) => ts > since,
            None => true,
        })
        .collect()
}

/// Highest parsed timestamp in a batch
pub fn max_timestamp(messages: &[Message]) -> Option<i64> {
    messages
        .iter()
        .filter_map(|m| m.timestamp.cursor_value())
        .max()
}
