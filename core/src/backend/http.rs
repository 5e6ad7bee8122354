/// REST backend adapter over hyper's pooled HTTP client
///
/// Endpoints:
///   GET  /api/conversations/:id/messages   ?page=N&size=N
///   POST /api/messages                     body: {"conversationId":..,"senderId":..,"content":".."}
///   PUT  /api/messages/:id/read
///   PUT  /api/conversations/:id/read       ?userId=N
///   GET  /api/conversations/:id
use super::Backend;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::types::{Conversation, ConversationId, Message, MessageId, NewMessage, UserId};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Longest error body echoed into `SyncError::Backend`
const MAX_ERROR_BODY: usize = 256;

/// Message lists come back bare, as a Spring page, or wrapped in an envelope
#[derive(Deserialize)]
#[serde(untagged)]
enum MessageList {
    Plain(Vec<Message>),
    Page { content: Vec<Message> },
    Envelope { data: Vec<Message> },
}

impl MessageList {
    fn into_vec(self) -> Vec<Message> {
        match self {
            MessageList::Plain(v) => v,
            MessageList::Page { content } => content,
            MessageList::Envelope { data } => data,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Single<T> {
    Envelope { data: T },
    Plain(T),
}

impl<T> Single<T> {
    fn into_inner(self) -> T {
        match self {
            Single::Envelope { data } => data,
            Single::Plain(v) => v,
        }
    }
}

/// Backend reached over plain HTTP
#[derive(Clone)]
pub struct HttpBackend {
    client: HttpClient,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self> {
        let url = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("Invalid backend URL: {}", e)))?;
        if url.scheme() != "http" {
            return Err(SyncError::Config(format!(
                "Unsupported backend scheme: {}",
                url.scheme()
            )));
        }

        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.backend_url, config.auth_token.clone())
    }

    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let uri = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, uri);

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header("Accept", "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Full::new(Bytes::from(bytes))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder
            .body(body)
            .map_err(|e| SyncError::Http(format!("Invalid request for {}: {}", uri, e)))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| SyncError::Http(format!("{}: {}", uri, e)))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .map_err(|e| SyncError::Http(format!("body read error: {}", e)))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            let message: String = text.chars().take(MAX_ERROR_BODY).collect();
            return Err(SyncError::Backend {
                status: status.as_u16(),
                message,
            });
        }
        Ok(bytes)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.request(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn conversation_path(id: &ConversationId) -> String {
    format!("/api/conversations/{}", urlencoding::encode(id.as_str()))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: Option<u32>,
        size: Option<u32>,
    ) -> Result<Vec<Message>> {
        let mut path = format!("{}/messages", conversation_path(conversation_id));
        let query: Vec<String> = [("page", page), ("size", size)]
            .iter()
            .filter_map(|(k, v)| v.map(|v| format!("{}={}", k, v)))
            .collect();
        if !query.is_empty() {
            path.push('?');
            path.push_str(&query.join("&"));
        }

        let list: MessageList = self.get_json(&path).await?;
        let mut messages = list.into_vec();
        // Some endpoints omit the conversation id on each entry
        for msg in messages.iter_mut().filter(|m| m.conversation_id.is_empty()) {
            msg.conversation_id = conversation_id.clone();
        }
        Ok(messages)
    }

    async fn send_message(&self, message: &NewMessage) -> Result<Message> {
        let body = serde_json::to_vec(message)?;
        let bytes = self
            .request(Method::POST, "/api/messages", Some(body))
            .await?;
        let mut sent = serde_json::from_slice::<Single<Message>>(&bytes)?.into_inner();
        if sent.conversation_id.is_empty() {
            sent.conversation_id = message.conversation_id.clone();
        }
        Ok(sent)
    }

    async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        let path = format!("/api/messages/{}/read", message_id);
        self.request(Method::PUT, &path, None).await?;
        Ok(())
    }

    async fn mark_all_read(&self, conversation_id: &ConversationId, user_id: UserId) -> Result<()> {
        let path = format!("{}/read?userId={}", conversation_path(conversation_id), user_id);
        self.request(Method::PUT, &path, None).await?;
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        let conv: Single<Conversation> = self.get_json(&conversation_path(conversation_id)).await?;
        Ok(conv.into_inner())
    }
}
