/// CLI for one-shot chat operations against the backend
use chatsync_core::backend::{Backend, HttpBackend};
use chatsync_core::fetcher::Fetcher;
use chatsync_core::{Config, ConversationId, Message, NewMessage};
use colored::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let bin = args.first().cloned().unwrap_or_else(|| "cli".to_string());

    let (config, rest) = match Config::from_args(&args) {
        Ok(parsed) => parsed,
        Err(_) => {
            print_usage(&bin);
            return Ok(());
        }
    };
    let Some(command) = rest.first() else {
        print_usage(&bin);
        return Ok(());
    };

    let backend = Arc::new(HttpBackend::from_config(&config)?);

    match command.as_str() {
        "send" => {
            if rest.len() < 4 {
                eprintln!("{}", format!("Usage: {} <url> send <conversation_id> <sender_id> <message>", bin).yellow());
                return Ok(());
            }
            let sender_id = rest[2].parse::<i64>()?;
            let message = NewMessage::new(rest[1].as_str(), sender_id, rest[3..].join(" "));
            message.validate()?;
            match backend.send_message(&message).await {
                Ok(sent) => println!(
                    "{} Message sent! ID: {}",
                    "✓".green().bold(),
                    sent.id.map(|id| id.to_string()).unwrap_or_else(|| "pending".to_string())
                ),
                Err(e) => fail(&e.to_string()),
            }
        }
        "history" => {
            if rest.len() < 2 {
                eprintln!("{}", format!("Usage: {} <url> history <conversation_id> [since]", bin).yellow());
                return Ok(());
            }
            let fetcher = Fetcher::new(backend.clone(), config.fetch_timeout, config.page_size);
            let conversation_id = ConversationId::new(rest[1].as_str());
            let since = rest.get(2).and_then(|s| chatsync_core::timestamp::parse_str(s));
            match fetcher.fetch_since(&conversation_id, since).await {
                Ok(messages) => print_messages(&messages),
                Err(e) => fail(&e.to_string()),
            }
        }
        "read" => {
            let Some(id) = rest.get(1).and_then(|s| s.parse::<i64>().ok()) else {
                eprintln!("{}", format!("Usage: {} <url> read <message_id>", bin).yellow());
                return Ok(());
            };
            match backend.mark_read(id).await {
                Ok(()) => println!("{} Message {} marked read", "✓".green().bold(), id),
                Err(e) => fail(&e.to_string()),
            }
        }
        "read-all" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} <url> read-all <conversation_id> <user_id>", bin).yellow());
                return Ok(());
            }
            let conversation_id = ConversationId::new(rest[1].as_str());
            let user_id = rest[2].parse::<i64>()?;
            match backend.mark_all_read(&conversation_id, user_id).await {
                Ok(()) => println!("{} Conversation {} marked read", "✓".green().bold(), conversation_id),
                Err(e) => fail(&e.to_string()),
            }
        }
        "join" => {
            let Some(id) = rest.get(1) else {
                eprintln!("{}", format!("Usage: {} <url> join <conversation_id>", bin).yellow());
                return Ok(());
            };
            match backend.get_conversation(&ConversationId::new(id.as_str())).await {
                Ok(conv) => {
                    println!("{}", "Conversation:".bright_white().bold());
                    println!("{:-<60}", "");
                    println!("  ID: {}", conv.id.to_string().cyan());
                    println!("  Participants: {:?}", conv.participants);
                    if let Some(ts) = conv.last_message_at {
                        println!("  Last message: {}", ts.to_rfc3339());
                    }
                }
                Err(e) => fail(&e.to_string()),
            }
        }
        other => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_messages(messages: &[Message]) {
    if messages.is_empty() {
        println!("No messages");
        return;
    }
    println!("Messages ({}):", messages.len());
    println!("{:-<60}", "");
    for msg in messages {
        let marker = if msg.read { " " } else { "•" };
        println!(
            "{} {} {} {}: {}",
            marker.bright_blue(),
            msg.timestamp.to_rfc3339().dimmed(),
            format!("#{}", msg.id.unwrap_or_default()).cyan(),
            msg.sender_id.to_string().yellow(),
            msg.content
        );
    }
}

fn fail(error: &str) {
    eprintln!("{} Error: {}", "✗".red().bold(), error);
    std::process::exit(1);
}

fn print_usage(bin: &str) {
    println!("{}", "⚡ ChatSync CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <backend_url> <command> [args] [--token <token>]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <conversation_id> <sender_id> <message>   Send a message", "send".cyan());
    println!("  {} <conversation_id> [since]                Show messages newer than since", "history".cyan());
    println!("  {} <message_id>                                Mark one message read", "read".cyan());
    println!("  {} <conversation_id> <user_id>             Mark a conversation read", "read-all".cyan());
    println!("  {} <conversation_id>                           Show conversation details", "join".cyan());
}
