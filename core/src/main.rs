/// ChatSync tail - follows one conversation until Ctrl+C
use chatsync_core::backend::HttpBackend;
use chatsync_core::poller::{ErrorCallback, MessagesCallback};
use chatsync_core::{Config, ConversationId, Message, MessagingService, SyncError};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let conversation_id = rest
        .first()
        .map(|s| ConversationId::new(s.as_str()))
        .ok_or_else(|| anyhow::anyhow!("Missing conversation id"))?;

    let backend = HttpBackend::from_config(&config)?;
    let service = MessagingService::new(Arc::new(backend), &config);

    info!("🚀 Following conversation {}", conversation_id);
    info!("   Backend: {}", config.backend_url);
    info!("   Poll interval: {:?}", config.poll_interval);

    let conversation = service.join_conversation(conversation_id.clone()).await;
    info!("   Participants: {:?}", conversation.participants);

    if let (Some(_), Some(user_id)) = (&config.push_url, config.user_id) {
        service
            .connect_push(user_id, config.auth_token.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Push error: {}", e))?;
    }

    let on_messages: MessagesCallback = Arc::new(|messages: Vec<Message>| {
        for msg in messages {
            info!(
                "[{}] #{} {}: {}",
                msg.timestamp.to_rfc3339(),
                msg.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                msg.sender_id,
                msg.content
            );
        }
    });
    let on_error: ErrorCallback = Arc::new(|e: &SyncError| warn!("Polling degraded: {}", e));

    let handle = service
        .start_polling(conversation_id, on_messages, None, Some(on_error))
        .await
        .map_err(|e| anyhow::anyhow!("Polling error: {}", e))?;

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received, stopping");

    handle.stop().await;
    service.disconnect_push().await;
    Ok(())
}
