use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{config::load_config_file, load_config, ClientEvent, RealtimeClient};
use shared::domain::ChannelId;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Headless client: connects, prints every event and optionally sends one message.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, conflicts_with_all = ["email", "password"])]
    token: Option<String>,
    #[arg(long, requires = "password")]
    email: Option<String>,
    #[arg(long, requires = "email")]
    password: Option<String>,
    /// Defaults to client.toml in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, requires = "send_text")]
    send_channel: Option<u64>,
    #[arg(long, requires = "send_channel")]
    send_text: Option<String>,
}

fn describe(event: &ClientEvent) -> String {
    match event {
        ClientEvent::Disconnected {
            was_unexpected,
            error,
        } => match error {
            Some(err) => format!("unexpected={was_unexpected} error={err}"),
            None => format!("unexpected={was_unexpected}"),
        },
        ClientEvent::ServerAvailable(server)
        | ClientEvent::ServerUnavailable(server)
        | ClientEvent::JoinedServer(server)
        | ClientEvent::LeftServer(server)
        | ClientEvent::ServerUpdated(server) => format!("server={} name={}", server.id, server.name),
        ClientEvent::ChannelCreated { channel, .. }
        | ClientEvent::ChannelDestroyed { channel, .. }
        | ClientEvent::ChannelUpdated { channel, .. } => {
            format!("channel={} name={}", channel.id, channel.name)
        }
        ClientEvent::MessageReceived { message, .. }
        | ClientEvent::MessageUpdated { message, .. }
        | ClientEvent::MessageSent { message } => format!(
            "channel={} author={} message={} {}",
            message.channel_id, message.author_id, message.id, message.content
        ),
        ClientEvent::UserJoined { user, .. }
        | ClientEvent::UserLeft { user, .. }
        | ClientEvent::UserUpdated { user, .. }
        | ClientEvent::UserPresenceUpdated { user, .. } => format!("user={}", user.key.user_id),
        _ => String::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,client_core=debug")),
        )
        .init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => load_config()?,
    };
    let client = RealtimeClient::with_defaults(config);

    let mut events = client.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("[{}] {}", event.name(), describe(&event)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    match (args.token, args.email, args.password) {
        (Some(token), _, _) => client.connect(&token).await?,
        (None, Some(email), Some(password)) => {
            client.login(&email, &password).await?;
        }
        _ => bail!("either --token or --email with --password is required"),
    }

    if let (Some(channel), Some(text)) = (args.send_channel, args.send_text) {
        let message = client.send_message(ChannelId(channel), &text).await?;
        info!(nonce = message.nonce, "message submitted");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = client.wait_for_disconnect() => warn!("session ended"),
    }
    client.stop().await?;
    printer.abort();
    Ok(())
}
