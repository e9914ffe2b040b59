use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ClientEvent, SyncClient};
use serde_json::Value;
use shared::domain::{ConversationId, DeliveryState, MessageId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::warn;

/// Terminal chat client. Lines typed on stdin are sent to the open
/// conversation; `/older` loads an older history page, `/quit` exits.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    /// Conversation to open; defaults to the first one listed.
    #[arg(long)]
    conversation: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(ws_url) = args.ws_url {
        settings.ws_url = ws_url;
    }
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = Some(user_id);
    }

    let on_unauthorized = || warn!("session rejected by the server, log in again");
    let client = SyncClient::from_settings(&settings, Arc::new(on_unauthorized))?;
    let printer = tokio::spawn(print_events(Arc::clone(&client), client.subscribe_events()));
    client.connect();

    let conversations = match client.list_conversations().await {
        Ok(conversations) => conversations,
        Err(err) => {
            warn!(error = %err, "could not list conversations");
            Vec::new()
        }
    };
    for conversation in &conversations {
        println!(
            "{}\t{}\t{}",
            conversation.id,
            conversation.participant_name,
            conversation.last_message.as_deref().unwrap_or_default()
        );
    }

    let conversation_id = args
        .conversation
        .map(ConversationId::new)
        .or_else(|| conversations.first().map(|c| c.id.clone()))
        .context("no conversation to open, pass --conversation")?;
    client.select_conversation(conversation_id.clone());
    println!("* opened conversation {conversation_id}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/older" => match client.load_older_history().await {
                Ok(stats) => println!("* loaded {} older messages", stats.inserted),
                Err(err) => println!("! {err:#}"),
            },
            _ => {
                if let Err(err) = client.send_message(&line) {
                    println!("! {err}");
                }
            }
        }
    }

    client.close();
    printer.abort();
    Ok(())
}

async fn print_events(client: Arc<SyncClient>, events: broadcast::Receiver<ClientEvent>) {
    let mut events = BroadcastStream::new(events);
    let mut printed: HashSet<MessageId> = HashSet::new();

    while let Some(event) = events.next().await {
        match event {
            Ok(ClientEvent::LogUpdated { conversation_id }) => {
                if client.active_conversation().as_ref() != Some(&conversation_id) {
                    continue;
                }
                for message in client.messages(&conversation_id) {
                    if message.delivery_state == DeliveryState::Acknowledged
                        && printed.insert(message.id.clone())
                    {
                        println!(
                            "[{}] {}: {}",
                            message.created_at.format("%H:%M:%S"),
                            message.sender_id,
                            message.content
                        );
                    }
                }
            }
            Ok(ClientEvent::MessageFailed { message_id, .. }) => {
                println!("! message {message_id} was not delivered");
            }
            Ok(ClientEvent::Connected) => println!("* connected"),
            Ok(ClientEvent::Disconnected { reason }) => println!("* disconnected ({reason})"),
            Ok(ClientEvent::ServerNotice(body)) => println!(
                "* {}: {}",
                body.get("sender").and_then(Value::as_str).unwrap_or("server"),
                body.get("message").and_then(Value::as_str).unwrap_or_default()
            ),
            Ok(ClientEvent::Error(message)) => warn!(%message, "client error"),
            Ok(_) => {}
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
            }
        }
    }
}
