/// Push channel against a local STOMP-over-WebSocket broker
mod common;

use chatsync_core::config::Config;
use chatsync_core::push::frame::decode_all;
use chatsync_core::push::{Command, PushChannel, PushMessageHandler, ReadReceiptHandler, StompFrame};
use chatsync_core::types::{ConversationId, Message, NewMessage, ReadReceipt};
use chatsync_core::MessagingService;
use common::{collector, ids, message, ScriptedBackend};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(5);

/// One-connection broker: answers CONNECT, records every client frame,
/// and forwards whatever the test pushes to the client
struct Broker {
    url: String,
    received: mpsc::UnboundedReceiver<StompFrame>,
    outgoing: mpsc::UnboundedSender<StompFrame>,
}

impl Broker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<StompFrame>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            loop {
                tokio::select! {
                    Some(frame) = outgoing_rx.recv() => {
                        if sink.send(WsMessage::Text(frame.encode())).await.is_err() {
                            break;
                        }
                    }
                    incoming = source.next() => {
                        let Some(Ok(WsMessage::Text(text))) = incoming else {
                            break;
                        };
                        for frame in decode_all(&text).unwrap() {
                            if frame.command == Command::Connect {
                                let connected = StompFrame::new(Command::Connected)
                                    .header("version", "1.2");
                                let _ = sink.send(WsMessage::Text(connected.encode())).await;
                            }
                            let _ = received_tx.send(frame);
                        }
                    }
                }
            }
        });

        Self {
            url,
            received,
            outgoing,
        }
    }

    async fn next(&mut self) -> StompFrame {
        timeout(WAIT, self.received.recv())
            .await
            .expect("broker timed out waiting for a frame")
            .expect("broker connection closed")
    }

    /// Skip frames until one matches `command`
    async fn next_of(&mut self, command: Command) -> StompFrame {
        loop {
            let frame = self.next().await;
            if frame.command == command {
                return frame;
            }
        }
    }

    fn push(&self, subscription: &str, destination: &str, body: serde_json::Value) {
        let frame = StompFrame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", destination)
            .header("message-id", "m-1")
            .body(body.to_string());
        self.outgoing.send(frame).unwrap();
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn noop_connected() -> Arc<dyn Fn() + Send + Sync> {
    Arc::new(|| {})
}

fn noop_error() -> Arc<dyn Fn(String) + Send + Sync> {
    Arc::new(|_: String| {})
}

fn message_sink() -> (PushMessageHandler, Arc<Mutex<Vec<Message>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: PushMessageHandler = Arc::new(move |msg| sink.lock().unwrap().push(msg));
    (handler, received)
}

#[tokio::test]
async fn test_connect_handshake_and_subscriptions() {
    let mut broker = Broker::start().await;
    let channel = PushChannel::new(broker.url.clone(), Duration::from_millis(100));
    let conversation = ConversationId::from("conv-1");
    let (handler, received) = message_sink();

    // Registered before connecting; sent once the session is up
    channel
        .subscribe_to_conversation(&conversation, handler)
        .await
        .unwrap();
    channel
        .connect(1, Some("tok".to_string()), noop_connected(), noop_error())
        .await
        .unwrap();

    let connect = broker.next_of(Command::Connect).await;
    assert_eq!(connect.get_header("accept-version"), Some("1.2"));
    assert_eq!(connect.get_header("Authorization"), Some("Bearer tok"));

    let mut destinations = Vec::new();
    let mut conversation_sub = String::new();
    for _ in 0..3 {
        let frame = broker.next_of(Command::Subscribe).await;
        let destination = frame.get_header("destination").unwrap().to_string();
        if destination == "/topic/conversation.conv-1" {
            conversation_sub = frame.get_header("id").unwrap().to_string();
        }
        destinations.push(destination);
    }
    destinations.sort();
    assert_eq!(
        destinations,
        vec![
            "/topic/conversation.conv-1",
            "/user/1/queue/messages",
            "/user/1/queue/read-receipts",
        ]
    );
    wait_until(|| channel.is_connected()).await;

    broker.push(
        &conversation_sub,
        "/topic/conversation.conv-1",
        serde_json::json!({"id": 5, "senderId": 2, "content": "pushed", "timestamp": 1709287200000i64}),
    );
    wait_until(|| !received.lock().unwrap().is_empty()).await;
    let pushed = received.lock().unwrap()[0].clone();
    assert_eq!(pushed.id, Some(5));
    assert_eq!(pushed.conversation_id, conversation);

    channel.disconnect().await;
    broker.next_of(Command::Disconnect).await;
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_resubscribe_replaces_previous_subscription() {
    let mut broker = Broker::start().await;
    let channel = PushChannel::new(broker.url.clone(), Duration::from_millis(100));
    let conversation = ConversationId::from("conv-1");
    channel
        .connect(1, None, noop_connected(), noop_error())
        .await
        .unwrap();
    broker.next_of(Command::Connect).await;
    wait_until(|| channel.is_connected()).await;

    let (first, _) = message_sink();
    channel
        .subscribe_to_conversation(&conversation, first)
        .await
        .unwrap();
    let mut subscribe = broker.next_of(Command::Subscribe).await;
    while subscribe.get_header("destination") != Some("/topic/conversation.conv-1") {
        subscribe = broker.next_of(Command::Subscribe).await;
    }
    let first_id = subscribe.get_header("id").unwrap().to_string();

    let (second, _) = message_sink();
    channel
        .subscribe_to_conversation(&conversation, second)
        .await
        .unwrap();
    let unsubscribe = broker.next().await;
    assert_eq!(unsubscribe.command, Command::Unsubscribe);
    assert_eq!(unsubscribe.get_header("id"), Some(first_id.as_str()));
    let resubscribe = broker.next().await;
    assert_eq!(resubscribe.command, Command::Subscribe);
    assert_ne!(resubscribe.get_header("id"), Some(first_id.as_str()));

    assert!(channel.unsubscribe_from_conversation(&conversation).await);
    assert_eq!(broker.next().await.command, Command::Unsubscribe);
    assert!(!channel.unsubscribe_from_conversation(&conversation).await);
    assert!(!channel.is_subscribed(&conversation).await);
}

#[tokio::test]
async fn test_publish_message_and_read_receipt() {
    let mut broker = Broker::start().await;
    let channel = PushChannel::new(broker.url.clone(), Duration::from_millis(100));

    // Not connected yet
    assert!(channel
        .send_message(&NewMessage::new("conv-1", 1, "early"))
        .await
        .is_err());

    channel
        .connect(1, None, noop_connected(), noop_error())
        .await
        .unwrap();
    broker.next_of(Command::Connect).await;
    wait_until(|| channel.is_connected()).await;

    channel
        .send_message(&NewMessage::new("conv-1", 1, "over push"))
        .await
        .unwrap();
    let send = broker.next_of(Command::Send).await;
    assert_eq!(send.get_header("destination"), Some("/app/chat.send"));
    let body: serde_json::Value = serde_json::from_str(&send.body).unwrap();
    assert_eq!(body["content"], "over push");
    assert_eq!(body["conversationId"], "conv-1");

    channel
        .mark_message_as_read(5, 2, &ConversationId::from("conv-1"))
        .await
        .unwrap();
    let read = broker.next_of(Command::Send).await;
    assert_eq!(read.get_header("destination"), Some("/app/chat.read"));
    let body: serde_json::Value = serde_json::from_str(&read.body).unwrap();
    assert_eq!(body["messageId"], 5);
    assert_eq!(body["senderId"], 2);
}

#[tokio::test]
async fn test_read_listeners_once_and_persistent() {
    let mut broker = Broker::start().await;
    let channel = PushChannel::new(broker.url.clone(), Duration::from_millis(100));

    let once_hits = Arc::new(AtomicUsize::new(0));
    let every_hits = Arc::new(AtomicUsize::new(0));
    let once_counter = once_hits.clone();
    let every_counter = every_hits.clone();
    let once: ReadReceiptHandler = Arc::new(move |receipt: ReadReceipt| {
        assert_eq!(receipt.message_id, 5);
        once_counter.fetch_add(1, Ordering::SeqCst);
    });
    let every: ReadReceiptHandler = Arc::new(move |_: ReadReceipt| {
        every_counter.fetch_add(1, Ordering::SeqCst);
    });
    channel.on_message_read(5, once, true).await;
    channel.on_message_read(5, every, false).await;

    channel
        .connect(1, None, noop_connected(), noop_error())
        .await
        .unwrap();
    broker.next_of(Command::Connect).await;
    wait_until(|| channel.is_connected()).await;

    for _ in 0..2 {
        broker.push(
            "sub-read-receipts",
            "/user/1/queue/read-receipts",
            serde_json::json!({"messageId": 5, "readerId": 2}),
        );
    }
    // Receipt for a message nobody listens to is ignored
    broker.push(
        "sub-read-receipts",
        "/user/1/queue/read-receipts",
        serde_json::json!({"messageId": 6}),
    );

    let every_seen = every_hits.clone();
    wait_until(move || every_seen.load(Ordering::SeqCst) == 2).await;
    assert_eq!(once_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reconnects_after_failure() {
    // Nothing listens yet; errors are reported and the loop keeps trying
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let channel = PushChannel::new(format!("ws://{}/ws", addr), Duration::from_millis(50));
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    channel
        .connect(
            1,
            None,
            noop_connected(),
            Arc::new(move |_: String| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    let seen = errors.clone();
    wait_until(move || seen.load(Ordering::SeqCst) >= 2).await;
    assert!(!channel.is_connected());
    channel.disconnect().await;
}

#[tokio::test]
async fn test_push_and_poll_deliver_each_message_once() {
    let mut broker = Broker::start().await;
    let backend = ScriptedBackend::new();
    backend.set_messages("conv-1", vec![message(7, "conv-1", -2_000)]);
    let config = Config {
        push_url: Some(broker.url.clone()),
        poll_interval: Duration::from_millis(200),
        ..Config::default()
    };
    let service = MessagingService::new(backend.clone(), &config);

    service.connect_push(1, None).await.unwrap();
    broker.next_of(Command::Connect).await;
    wait_until(|| service.push().is_some_and(|p| p.is_connected())).await;

    let (cb, batches) = collector();
    let _handle = service
        .start_polling("conv-1", cb, None, None)
        .await
        .unwrap();
    let mut subscribe = broker.next_of(Command::Subscribe).await;
    while subscribe.get_header("destination") != Some("/topic/conversation.conv-1") {
        subscribe = broker.next_of(Command::Subscribe).await;
    }
    let sub_id = subscribe.get_header("id").unwrap().to_string();

    let first = batches.clone();
    wait_until(move || !first.lock().unwrap().is_empty()).await;

    // Already delivered by the poll
    broker.push(
        &sub_id,
        "/topic/conversation.conv-1",
        serde_json::json!({"id": 7, "senderId": 2, "content": "m7"}),
    );
    // New over push, then seen again by the poll
    let later = message(8, "conv-1", -1_000);
    broker.push(
        &sub_id,
        "/topic/conversation.conv-1",
        serde_json::json!({"id": 8, "senderId": 2, "content": "m8", "timestamp": later.timestamp.millis}),
    );
    let pushed = batches.clone();
    wait_until(move || pushed.lock().unwrap().len() == 2).await;
    backend.append_message(later);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(ids(&batches), vec![vec![7], vec![8]]);
    assert_eq!(service.messages(&ConversationId::from("conv-1")).len(), 2);

    service.disconnect_push().await;
}
