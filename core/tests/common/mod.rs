#![allow(dead_code)]
//! Shared test helpers: an in-memory scripted backend and callback collectors

use async_trait::async_trait;
use chatsync_core::backend::Backend;
use chatsync_core::error::{Result, SyncError};
use chatsync_core::poller::{ErrorCallback, MessagesCallback};
use chatsync_core::timestamp::{now_millis, Timestamp};
use chatsync_core::types::{Conversation, ConversationId, Message, MessageId, NewMessage, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    messages: HashMap<ConversationId, Vec<Message>>,
    fail_fetches: u32,
    fetch_delay: Duration,
    fetch_times: Vec<Instant>,
    next_id: MessageId,
    sent: Vec<NewMessage>,
    read: Vec<MessageId>,
    read_all: Vec<(ConversationId, UserId)>,
    conversations: HashMap<ConversationId, Conversation>,
}

/// Backend whose responses are scripted by the test
pub struct ScriptedBackend {
    state: Mutex<State>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_id: 1,
                ..Default::default()
            }),
        })
    }

    pub fn set_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        self.state
            .lock()
            .unwrap()
            .messages
            .insert(ConversationId::from(conversation_id), messages);
    }

    pub fn append_message(&self, message: Message) {
        self.state
            .lock()
            .unwrap()
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().unwrap().fail_fetches = n;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = delay;
    }

    pub fn set_next_id(&self, id: MessageId) {
        self.state.lock().unwrap().next_id = id;
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.state
            .lock()
            .unwrap()
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetch_times.len()
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().fetch_times.clone()
    }

    pub fn sent(&self) -> Vec<NewMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn read(&self) -> Vec<MessageId> {
        self.state.lock().unwrap().read.clone()
    }

    pub fn read_all(&self) -> Vec<(ConversationId, UserId)> {
        self.state.lock().unwrap().read_all.clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        _page: Option<u32>,
        _size: Option<u32>,
    ) -> Result<Vec<Message>> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.fetch_times.push(Instant::now());
            state.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(SyncError::Http("scripted failure".to_string()));
        }
        Ok(state
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, message: &NewMessage) -> Result<Message> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.sent.push(message.clone());
        let persisted = Message {
            id: Some(id),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.unwrap_or_default(),
            receiver_id: message.receiver_id,
            content: message.content.clone(),
            timestamp: Timestamp::now(),
            read: false,
        };
        state
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(persisted.clone());
        Ok(persisted)
    }

    async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        self.state.lock().unwrap().read.push(message_id);
        Ok(())
    }

    async fn mark_all_read(&self, conversation_id: &ConversationId, user_id: UserId) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .read_all
            .push((conversation_id.clone(), user_id));
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| SyncError::Backend {
                status: 404,
                message: "not found".to_string(),
            })
    }
}

/// Message in `conversation_id` stamped `offset_ms` relative to now
pub fn message(id: MessageId, conversation_id: &str, offset_ms: i64) -> Message {
    message_at(id, conversation_id, now_millis() + offset_ms)
}

pub fn message_at(id: MessageId, conversation_id: &str, millis: i64) -> Message {
    Message {
        id: Some(id),
        conversation_id: ConversationId::from(conversation_id),
        sender_id: 2,
        receiver_id: Some(1),
        content: format!("message {}", id),
        timestamp: Timestamp::from_millis(millis),
        read: false,
    }
}

pub type Batches = Arc<Mutex<Vec<Vec<Message>>>>;

/// Callback that records every batch it receives
pub fn collector() -> (MessagesCallback, Batches) {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let callback: MessagesCallback = Arc::new(move |batch: Vec<Message>| {
        sink.lock().unwrap().push(batch);
    });
    (callback, batches)
}

pub fn error_counter() -> (ErrorCallback, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let callback: ErrorCallback = Arc::new(move |e: &SyncError| {
        sink.lock().unwrap().push(e.to_string());
    });
    (callback, errors)
}

pub fn ids(batches: &Batches) -> Vec<Vec<MessageId>> {
    batches
        .lock()
        .unwrap()
        .iter()
        .map(|b| b.iter().filter_map(|m| m.id).collect())
        .collect()
}
