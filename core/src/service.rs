/// Messaging service: the surface the UI layer talks to
///
/// Owns the poller, the optional push channel and one `MessageLog` per open
/// conversation. Messages from either transport go through the same log, so
/// the UI callback sees each message exactly once.
use crate::backend::Backend;
use crate::config::Config;
use crate::dedup::MessageLog;
use crate::error::{Result, SyncError};
use crate::fetcher::Fetcher;
use crate::poller::{ErrorCallback, MessagesCallback, PollHandle, Poller};
use crate::push::{PushChannel, PushMessageHandler, ReadReceiptHandler};
use crate::types::{Conversation, ConversationId, Message, MessageId, NewMessage, SyncEvent, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

type Logs = Arc<Mutex<HashMap<ConversationId, MessageLog>>>;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct MessagingService {
    backend: Arc<dyn Backend>,
    poller: Poller,
    push: Option<PushChannel>,
    logs: Logs,
    events: broadcast::Sender<SyncEvent>,
    reconcile_delay: Duration,
}

impl MessagingService {
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Self {
        let fetcher = Fetcher::new(backend.clone(), config.fetch_timeout, config.page_size);
        let poller = Poller::new(fetcher, config);
        let push = config
            .push_url
            .as_ref()
            .map(|url| PushChannel::new(url.clone(), config.push_reconnect_delay));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            backend,
            poller,
            push,
            logs: Arc::new(Mutex::new(HashMap::new())),
            events,
            reconcile_delay: config.reconcile_delay,
        }
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn push(&self) -> Option<&PushChannel> {
        self.push.as_ref()
    }

    /// Subscribe to service events (new messages, read receipts, push state)
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Start live updates for a conversation.
    ///
    /// `on_new_messages` receives only messages not seen before in this
    /// session, whichever transport delivered them. The returned handle is
    /// the stop function for exactly this session.
    pub async fn start_polling(
        &self,
        conversation_id: impl Into<ConversationId>,
        on_new_messages: MessagesCallback,
        initial_since: Option<&str>,
        on_error: Option<ErrorCallback>,
    ) -> Result<SyncHandle> {
        let conversation_id = conversation_id.into();
        conversation_id.validate()?;
        let initial_since = match initial_since {
            Some(raw) => Some(crate::timestamp::parse_str(raw).ok_or_else(|| {
                SyncError::Validation(format!("unparseable initial timestamp: {}", raw))
            })?),
            None => None,
        };

        lock(&self.logs).insert(conversation_id.clone(), MessageLog::new());
        let deliver = self.deliverer(conversation_id.clone(), on_new_messages);

        let handle = match self
            .poller
            .start(conversation_id.clone(), deliver.clone(), initial_since, on_error)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                lock(&self.logs).remove(&conversation_id);
                return Err(e);
            }
        };

        if let Some(push) = &self.push {
            let handler: PushMessageHandler = Arc::new(move |msg: Message| deliver(vec![msg]));
            if let Err(e) = push.subscribe_to_conversation(&conversation_id, handler).await {
                warn!("Push subscribe failed for {}: {}", conversation_id, e);
            }
        }
        Ok(SyncHandle {
            service: self.clone(),
            poll: handle,
        })
    }

    /// Merge through the conversation log, forward only what is new
    fn deliverer(&self, conversation_id: ConversationId, on_new: MessagesCallback) -> MessagesCallback {
        let logs = self.logs.clone();
        let events = self.events.clone();
        Arc::new(move |batch: Vec<Message>| {
            let added = {
                let mut logs = lock(&logs);
                match logs.get_mut(&conversation_id) {
                    Some(log) => log.merge(batch),
                    // Conversation was closed; nothing to deliver to
                    None => return,
                }
            };
            if added.is_empty() {
                return;
            }
            let _ = events.send(SyncEvent::NewMessages {
                conversation_id: conversation_id.clone(),
                messages: added.clone(),
            });
            on_new(added);
        })
    }

    pub async fn stop_polling(&self, conversation_id: &ConversationId) {
        self.poller.stop(conversation_id).await;
        if let Some(push) = &self.push {
            push.unsubscribe_from_conversation(conversation_id).await;
        }
        lock(&self.logs).remove(conversation_id);
    }

    /// Stop everything; new sessions are refused for the shutdown cooldown
    pub async fn stop_all_polling(&self) {
        let open: Vec<ConversationId> = lock(&self.logs).drain().map(|(id, _)| id).collect();
        self.poller.stop_all().await;
        if let Some(push) = &self.push {
            for id in &open {
                push.unsubscribe_from_conversation(id).await;
            }
        }
    }

    pub async fn force_poll(&self, conversation_id: &ConversationId) -> bool {
        self.poller.force_poll(conversation_id).await
    }

    /// The UI signals whether any chat screen is visible
    pub async fn set_messaging_active(&self, active: bool) {
        self.poller.set_active(active).await;
    }

    /// Messages merged so far for an open conversation
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        lock(&self.logs)
            .get(conversation_id)
            .map(|log| log.messages().to_vec())
            .unwrap_or_default()
    }

    /// Look up a conversation. Never fails: returns a stub when the backend can't answer.
    pub async fn join_conversation(&self, conversation_id: impl Into<ConversationId>) -> Conversation {
        let conversation_id = conversation_id.into();
        match self.backend.get_conversation(&conversation_id).await {
            Ok(conversation) => conversation,
            Err(e) => {
                warn!("Could not load conversation {}: {}", conversation_id, e);
                Conversation::stub(conversation_id)
            }
        }
    }

    /// Post a message. Not echoed locally: a forced poll shortly afterwards
    /// picks up the persisted copy.
    pub async fn send_message(&self, message: NewMessage) -> Result<Message> {
        message.validate()?;
        let sent = self.backend.send_message(&message).await?;
        info!(
            "Sent message {:?} to conversation {}",
            sent.id, message.conversation_id
        );

        let poller = self.poller.clone();
        let delay = self.reconcile_delay;
        let conversation_id = message.conversation_id.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if !poller.force_poll(&conversation_id).await {
                debug!("No open session to reconcile {}", conversation_id);
            }
        });
        Ok(sent)
    }

    /// Mark one message read on the backend and tell the sender if push is up
    pub async fn mark_as_read(&self, message_id: MessageId) -> Result<()> {
        self.backend.mark_read(message_id).await?;

        let located = {
            let mut logs = lock(&self.logs);
            logs.iter_mut().find_map(|(id, log)| {
                log.mark_read(message_id).then(|| {
                    let sender = log
                        .messages()
                        .iter()
                        .find(|m| m.id == Some(message_id))
                        .map(|m| m.sender_id);
                    (id.clone(), sender)
                })
            })
        };

        if let (Some(push), Some((conversation_id, Some(sender_id)))) = (&self.push, located) {
            if push.is_connected() {
                if let Err(e) = push
                    .mark_message_as_read(message_id, sender_id, &conversation_id)
                    .await
                {
                    debug!("Read receipt not published: {}", e);
                }
            }
        }
        let _ = self.events.send(SyncEvent::MessageRead { message_id });
        Ok(())
    }

    pub async fn mark_all_as_read(&self, conversation_id: &ConversationId, user_id: UserId) -> Result<()> {
        conversation_id.validate()?;
        self.backend.mark_all_read(conversation_id, user_id).await?;
        if let Some(log) = lock(&self.logs).get_mut(conversation_id) {
            log.mark_all_read();
        }
        debug!("Marked conversation {} read for user {}", conversation_id, user_id);
        Ok(())
    }

    /// Connect the push channel; a no-op returning an error when none is configured
    pub async fn connect_push(&self, user_id: UserId, auth_token: Option<String>) -> Result<()> {
        let push = self
            .push
            .as_ref()
            .ok_or_else(|| SyncError::Config("No push URL configured".to_string()))?;

        let connected_events = self.events.clone();
        let error_events = self.events.clone();
        push.connect(
            user_id,
            auth_token,
            Arc::new(move || {
                let _ = connected_events.send(SyncEvent::PushConnected);
            }),
            Arc::new(move |reason: String| {
                let _ = error_events.send(SyncEvent::PushError { reason });
            }),
        )
        .await
    }

    pub async fn disconnect_push(&self) {
        if let Some(push) = &self.push {
            push.disconnect().await;
        }
    }

    /// Forward read receipts for `message_id` to `handler`
    pub async fn on_message_read(&self, message_id: MessageId, handler: ReadReceiptHandler, once: bool) -> Result<()> {
        let push = self
            .push
            .as_ref()
            .ok_or_else(|| SyncError::Config("No push URL configured".to_string()))?;
        let logs = self.logs.clone();
        let events = self.events.clone();
        let wrapped: ReadReceiptHandler = Arc::new(move |receipt| {
            for log in lock(&logs).values_mut() {
                log.mark_read(receipt.message_id);
            }
            let _ = events.send(SyncEvent::MessageRead {
                message_id: receipt.message_id,
            });
            handler(receipt);
        });
        push.on_message_read(message_id, wrapped, once).await;
        Ok(())
    }
}

/// Stop function returned by `start_polling`
pub struct SyncHandle {
    service: MessagingService,
    poll: PollHandle,
}

impl SyncHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        self.poll.conversation_id()
    }

    pub fn is_active(&self) -> bool {
        self.poll.is_active()
    }

    /// Stop this conversation unless a newer session already replaced it
    pub async fn stop(self) {
        let conversation_id = self.poll.conversation_id().clone();
        if !self.poll.stop().await {
            return;
        }
        if let Some(push) = &self.service.push {
            push.unsubscribe_from_conversation(&conversation_id).await;
        }
        lock(&self.service.logs).remove(&conversation_id);
    }
}

/// Poisoning only means a callback panicked; the log itself is still consistent
fn lock(logs: &Logs) -> MutexGuard<'_, HashMap<ConversationId, MessageLog>> {
    logs.lock().unwrap_or_else(|e| e.into_inner())
}
