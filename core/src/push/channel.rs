/// Push channel client: one WebSocket per user session, STOMP topics per conversation
///
/// Advisory only. The poll loop stays the correctness baseline; this channel
/// just gets messages and read receipts to the UI sooner.
use super::destinations;
use super::frame::{decode_all, Command, StompFrame};
use crate::error::{Result, SyncError};
use crate::types::{ConversationId, Message, MessageId, NewMessage, ReadReceipt, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub type PushMessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub type ReadReceiptHandler = Arc<dyn Fn(ReadReceipt) + Send + Sync>;
pub type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;
pub type PushErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

const USER_MESSAGES_SUB: &str = "sub-user-messages";
const READ_RECEIPTS_SUB: &str = "sub-read-receipts";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Subscription {
    id: String,
    handler: PushMessageHandler,
}

struct ReadListener {
    handler: ReadReceiptHandler,
    once: bool,
}

#[derive(Default)]
struct PushState {
    subscriptions: RwLock<HashMap<ConversationId, Subscription>>,
    read_listeners: RwLock<HashMap<MessageId, Vec<ReadListener>>>,
    outbound: RwLock<Option<mpsc::UnboundedSender<StompFrame>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    closing: AtomicBool,
}

/// Connection parameters captured at `connect` time
struct Session {
    url: String,
    host: String,
    user_id: UserId,
    auth_token: Option<String>,
    reconnect_delay: Duration,
    on_connected: ConnectedCallback,
    on_error: PushErrorCallback,
}

#[derive(Clone)]
pub struct PushChannel {
    url: String,
    reconnect_delay: Duration,
    state: Arc<PushState>,
}

impl PushChannel {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            state: Arc::new(PushState::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Open the connection for `user_id` and keep it up.
    ///
    /// Returns once the connection task is spawned. Every dropped or failed
    /// connection is reported to `on_error` and retried after the fixed
    /// reconnect delay; conversation subscriptions are restored on reconnect.
    pub async fn connect(
        &self,
        user_id: UserId,
        auth_token: Option<String>,
        on_connected: ConnectedCallback,
        on_error: PushErrorCallback,
    ) -> Result<()> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| SyncError::Config(format!("Invalid push URL: {}", e)))?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();

        let mut task = self.state.task.lock().await;
        if let Some(previous) = task.take() {
            debug!("Replacing existing push connection");
            previous.abort();
        }
        self.state.closing.store(false, Ordering::SeqCst);

        let session = Session {
            url: self.url.clone(),
            host,
            user_id,
            auth_token,
            reconnect_delay: self.reconnect_delay,
            on_connected,
            on_error,
        };
        *task = Some(tokio::spawn(run_connection(self.state.clone(), session)));
        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub async fn disconnect(&self) {
        self.state.closing.store(true, Ordering::SeqCst);
        if self.is_connected() {
            let _ = self.send_frame(StompFrame::new(Command::Disconnect)).await;
            // Give the writer a moment to flush DISCONNECT
            sleep(Duration::from_millis(50)).await;
        }
        if let Some(task) = self.state.task.lock().await.take() {
            task.abort();
        }
        self.state.connected.store(false, Ordering::SeqCst);
        *self.state.outbound.write().await = None;
        info!("Push channel disconnected");
    }

    /// Subscribe to a conversation topic, replacing any earlier subscription
    pub async fn subscribe_to_conversation(
        &self,
        conversation_id: &ConversationId,
        handler: PushMessageHandler,
    ) -> Result<()> {
        conversation_id.validate()?;
        let sub_id = format!("sub-{}", Uuid::new_v4());

        let mut subs = self.state.subscriptions.write().await;
        let previous = subs.insert(
            conversation_id.clone(),
            Subscription {
                id: sub_id.clone(),
                handler,
            },
        );
        // Sent under the lock so a concurrent reconnect can't double-subscribe
        if let Some(outbound) = self.state.outbound.read().await.as_ref() {
            if let Some(prev) = previous {
                let _ = outbound.send(StompFrame::unsubscribe(&prev.id));
            }
            let _ = outbound.send(StompFrame::subscribe(
                &sub_id,
                &destinations::conversation(conversation_id),
            ));
        }
        debug!("Subscribed to conversation {} as {}", conversation_id, sub_id);
        Ok(())
    }

    /// Remove a conversation subscription; a no-op when not subscribed
    pub async fn unsubscribe_from_conversation(&self, conversation_id: &ConversationId) -> bool {
        let mut subs = self.state.subscriptions.write().await;
        let Some(sub) = subs.remove(conversation_id) else {
            return false;
        };
        if let Some(outbound) = self.state.outbound.read().await.as_ref() {
            let _ = outbound.send(StompFrame::unsubscribe(&sub.id));
        }
        debug!("Unsubscribed from conversation {}", conversation_id);
        true
    }

    pub async fn is_subscribed(&self, conversation_id: &ConversationId) -> bool {
        self.state
            .subscriptions
            .read()
            .await
            .contains_key(conversation_id)
    }

    /// Publish a message; persistence is confirmed by the poll loop, not here
    pub async fn send_message(&self, message: &NewMessage) -> Result<()> {
        message.validate()?;
        let body = serde_json::to_string(message)?;
        self.send_frame(StompFrame::send_json(destinations::SEND, body))
            .await
    }

    /// Publish a read receipt for one message
    pub async fn mark_message_as_read(
        &self,
        message_id: MessageId,
        sender_id: UserId,
        conversation_id: &ConversationId,
    ) -> Result<()> {
        let body = json!({
            "messageId": message_id,
            "senderId": sender_id,
            "conversationId": conversation_id,
        })
        .to_string();
        self.send_frame(StompFrame::send_json(destinations::READ, body))
            .await
    }

    /// Register a read-receipt listener for `message_id`
    pub async fn on_message_read(
        &self,
        message_id: MessageId,
        handler: ReadReceiptHandler,
        once: bool,
    ) {
        self.state
            .read_listeners
            .write()
            .await
            .entry(message_id)
            .or_default()
            .push(ReadListener { handler, once });
    }

    async fn send_frame(&self, frame: StompFrame) -> Result<()> {
        let outbound = self.state.outbound.read().await;
        let tx = outbound
            .as_ref()
            .ok_or_else(|| SyncError::Push("Push channel is not connected".to_string()))?;
        tx.send(frame)
            .map_err(|_| SyncError::Push("Push connection closed".to_string()))
    }
}

async fn run_connection(state: Arc<PushState>, session: Session) {
    loop {
        match run_session(&state, &session).await {
            Ok(()) => info!("Push connection closed"),
            Err(e) => {
                warn!("Push connection error: {}", e);
                (session.on_error)(e.to_string());
            }
        }
        state.connected.store(false, Ordering::SeqCst);
        *state.outbound.write().await = None;

        if state.closing.load(Ordering::SeqCst) {
            break;
        }
        debug!("Reconnecting push channel in {:?}", session.reconnect_delay);
        sleep(session.reconnect_delay).await;
    }
}

async fn run_session(state: &PushState, session: &Session) -> Result<()> {
    let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(session.url.as_str()))
        .await
        .map_err(|_| SyncError::Timeout("WebSocket connect timeout".to_string()))?
        .map_err(|e| SyncError::Push(format!("WebSocket connect failed: {}", e)))?;
    let (mut sink, mut stream) = ws.split();

    let connect = StompFrame::connect(&session.host, session.auth_token.as_deref());
    sink.send(WsMessage::Text(connect.encode()))
        .await
        .map_err(|e| SyncError::Push(format!("CONNECT send failed: {}", e)))?;

    timeout(CONNECT_TIMEOUT, async {
        while let Some(msg) = stream.next().await {
            let text = match msg {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(SyncError::Push(format!("Handshake read failed: {}", e))),
            };
            for frame in decode_all(&text)? {
                match frame.command {
                    Command::Connected => return Ok(()),
                    Command::Error => return Err(stomp_error(&frame)),
                    _ => {}
                }
            }
        }
        Err(SyncError::Push("Connection closed during STOMP handshake".to_string()))
    })
    .await
    .map_err(|_| SyncError::Timeout("STOMP handshake timeout".to_string()))??;

    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let subs = state.subscriptions.read().await;
        *state.outbound.write().await = Some(tx.clone());
        let _ = tx.send(StompFrame::subscribe(
            USER_MESSAGES_SUB,
            &destinations::user_messages(session.user_id),
        ));
        let _ = tx.send(StompFrame::subscribe(
            READ_RECEIPTS_SUB,
            &destinations::user_read_receipts(session.user_id),
        ));
        for (conversation_id, sub) in subs.iter() {
            let _ = tx.send(StompFrame::subscribe(
                &sub.id,
                &destinations::conversation(conversation_id),
            ));
        }
    }
    state.connected.store(true, Ordering::SeqCst);
    info!("Push channel connected for user {}", session.user_id);
    (session.on_connected)();

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                sink.send(WsMessage::Text(frame.encode()))
                    .await
                    .map_err(|e| SyncError::Push(format!("Write failed: {}", e)))?;
                if frame.command == Command::Disconnect {
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non-UTF-8 push frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SyncError::Push(format!("Read failed: {}", e))),
                };
                match decode_all(&text) {
                    Ok(frames) => {
                        for frame in frames {
                            if frame.command == Command::Error {
                                return Err(stomp_error(&frame));
                            }
                            dispatch(state, frame).await;
                        }
                    }
                    Err(e) => warn!("Undecodable push frame: {}", e),
                }
            }
        }
    }
}

fn stomp_error(frame: &StompFrame) -> SyncError {
    let message = frame
        .get_header("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.clone());
    SyncError::Push(format!("Broker error: {}", message))
}

async fn dispatch(state: &PushState, frame: StompFrame) {
    if frame.command != Command::Message {
        debug!("Ignoring {} frame", frame.command);
        return;
    }
    let subscription = frame.get_header("subscription").unwrap_or_default();
    let is_receipt = subscription == READ_RECEIPTS_SUB
        || frame
            .get_header("destination")
            .is_some_and(|d| d.ends_with("/queue/read-receipts"));

    if is_receipt {
        match serde_json::from_str::<ReadReceipt>(&frame.body) {
            Ok(receipt) => fire_read_listeners(state, receipt).await,
            Err(e) => warn!("Malformed read receipt: {}", e),
        }
        return;
    }

    let message = match serde_json::from_str::<Message>(&frame.body) {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed pushed message: {}", e);
            return;
        }
    };

    let handler = {
        let subs = state.subscriptions.read().await;
        subs.iter()
            .find(|(_, sub)| sub.id == subscription)
            .or_else(|| subs.get_key_value(&message.conversation_id))
            .map(|(id, sub)| (id.clone(), sub.handler.clone()))
    };
    match handler {
        Some((conversation_id, handler)) => {
            let mut message = message;
            if message.conversation_id.is_empty() {
                message.conversation_id = conversation_id;
            }
            handler(message);
        }
        None => debug!(
            "Pushed message for unsubscribed conversation {}",
            message.conversation_id
        ),
    }
}

async fn fire_read_listeners(state: &PushState, receipt: ReadReceipt) {
    let handlers: Vec<ReadReceiptHandler> = {
        let mut listeners = state.read_listeners.write().await;
        let Some(entries) = listeners.get_mut(&receipt.message_id) else {
            return;
        };
        let handlers = entries.iter().map(|l| l.handler.clone()).collect();
        entries.retain(|l| !l.once);
        if entries.is_empty() {
            listeners.remove(&receipt.message_id);
        }
        handlers
    };
    debug!(
        "Read receipt for message {} ({} listeners)",
        receipt.message_id,
        handlers.len()
    );
    for handler in handlers {
        handler(receipt.clone());
    }
}
