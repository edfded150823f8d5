//! Voxlink headless client
//!
//! Logs in, connects signaling and drives calls and messaging from the
//! command line.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxlink_core::call::format_duration;
use voxlink_core::{
    badge_title, CallEvent, ClientConfig, ConversationKey, MessageStore, OutgoingContent,
    OutgoingFile, Theme, TransportState, UserInfo, VoxClient,
};

/// Voxlink CLI
#[derive(Parser)]
#[command(name = "voxlink")]
#[command(about = "Headless chat and voice call client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Server host, overrides config.json
    #[arg(long)]
    server: Option<String>,

    /// Server port, overrides config.json
    #[arg(long)]
    port: Option<u16>,

    /// Use TLS for HTTP and WebSocket
    #[arg(long)]
    tls: bool,

    /// Username, required when there is no saved session
    #[arg(short, long)]
    username: Option<String>,

    /// Password
    #[arg(short, long)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay online and report incoming calls and messages
    Listen {
        /// Answer incoming calls automatically
        #[arg(long)]
        auto_accept: bool,
    },

    /// Call a user and stay on the line until Ctrl+C
    Call {
        /// User ID to call
        user_id: String,

        /// Display name shown to the callee's client
        #[arg(long)]
        name: Option<String>,
    },

    /// Send a message
    Send {
        /// User ID, or group ID with --group
        to: String,

        #[arg(long)]
        group: bool,

        /// Message text
        #[arg(short, long)]
        text: Option<String>,

        /// File to attach
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Print conversation history
    History {
        /// User ID, or group ID with --group
        with: String,

        #[arg(long)]
        group: bool,

        /// Older pages to load after the newest one
        #[arg(long, default_value_t = 0)]
        older: usize,
    },

    /// Show or set the theme preference
    Theme {
        /// light or dark
        value: Option<String>,
    },

    /// Show recent searches, or record one
    Search {
        query: Option<String>,
    },

    /// Forget the saved session
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "voxlink=info,voxlink_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No data directory on this platform")?
            .join("voxlink"),
    };
    std::fs::create_dir_all(&data_dir)?;

    let mut config = ClientConfig::load(&data_dir)?;
    if let Some(server) = &cli.server {
        config.server_host = server.clone();
    }
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if cli.tls {
        config.use_tls = true;
    }

    let client = VoxClient::new(config, &data_dir)?;

    match &cli.command {
        Commands::Theme { value } => return theme(&client, value.as_deref()),
        Commands::Search { query } => return search(&client, query.as_deref()),
        Commands::Logout => {
            client.logout().await?;
            println!("Logged out");
            return Ok(());
        }
        _ => {}
    }

    sign_in(&client, &cli).await?;

    match cli.command {
        Commands::Listen { auto_accept } => listen(&client, auto_accept).await?,
        Commands::Call { user_id, name } => call(&client, &user_id, name).await?,
        Commands::Send {
            to,
            group,
            text,
            file,
        } => send(&client, conversation(&client, &to, group)?, text, file).await?,
        Commands::History { with, group, older } => {
            history(&client, conversation(&client, &with, group)?, older).await?
        }
        Commands::Theme { .. } | Commands::Search { .. } | Commands::Logout => {}
    }

    Ok(())
}

async fn sign_in(client: &VoxClient, cli: &Cli) -> anyhow::Result<()> {
    match client.resume().await? {
        Some(user) => tracing::info!("Using saved session for {}", user.id),
        None => {
            let (Some(username), Some(password)) = (&cli.username, &cli.password) else {
                anyhow::bail!("No saved session; pass --username and --password");
            };
            client.login(username, password).await?;
        }
    }

    // Signals emitted before the socket is up are dropped.
    let mut state = client.signaling().watch_state();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == TransportState::Connected),
    )
    .await
    .context("Timed out connecting to the signaling server")??;
    Ok(())
}

fn conversation(client: &VoxClient, id: &str, group: bool) -> anyhow::Result<ConversationKey> {
    if group {
        return Ok(ConversationKey::group(id));
    }
    let me = client.current_user().context("Not logged in")?;
    Ok(ConversationKey::direct(&me.id, id))
}

async fn listen(client: &VoxClient, auto_accept: bool) -> anyhow::Result<()> {
    let calls = client.calls()?;
    let store = client.store()?;
    let mut events = calls.subscribe();
    let mut unread = store.unread().subscribe();

    println!("Listening, Ctrl+C to quit");
    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { continue };
                if let CallEvent::Incoming(snapshot) = &event {
                    println!("Incoming call from {}", snapshot.peer.display_name);
                    if auto_accept {
                        if let Err(e) = calls.accept().await {
                            tracing::error!("Failed to accept call: {}", e);
                        }
                    }
                }
                report(&event);
            }
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                let total = *unread.borrow();
                println!("{}", badge_title("Voxlink", total));
                print_previews(&store);
            }
            _ = tokio::signal::ctrl_c() => {
                calls.end().await?;
                break;
            }
        }
    }
    Ok(())
}

async fn call(client: &VoxClient, user_id: &str, name: Option<String>) -> anyhow::Result<()> {
    let calls = client.calls()?;
    let mut events = calls.subscribe();
    let peer = UserInfo::new(user_id, name.as_deref().unwrap_or(user_id));

    let call_id = calls.initiate(peer).await?;
    println!("Calling {} ({}), Ctrl+C to hang up", user_id, call_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { continue };
                report(&event);
                if matches!(event, CallEvent::Idle) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                calls.end().await?;
                break;
            }
        }
    }
    Ok(())
}

fn report(event: &CallEvent) {
    match event {
        CallEvent::StatusChanged(snapshot) => {
            println!("Call {}: {}", snapshot.call_id, snapshot.status)
        }
        CallEvent::Tick { elapsed, .. } => println!("  {}", format_duration(*elapsed)),
        CallEvent::PeerMuted { muted, .. } => {
            println!("Peer {}", if *muted { "muted" } else { "unmuted" })
        }
        CallEvent::Failed { error, .. } => eprintln!("Call failed: {}", error),
        CallEvent::Ended { reason, .. } => println!("Call ended: {}", reason),
        CallEvent::Incoming(_) | CallEvent::Idle => {}
    }
}

async fn send(
    client: &VoxClient,
    key: ConversationKey,
    text: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let file = match file {
        Some(path) => {
            let data = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let mime_type = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .to_string();
            Some(OutgoingFile {
                file_name,
                mime_type,
                data,
            })
        }
        None => None,
    };

    let store = client.store()?;
    let message = store.send(&key, OutgoingContent { text, file }).await?;
    println!("Sent {} at {}", message.id, message.created_at);
    Ok(())
}

async fn history(client: &VoxClient, key: ConversationKey, older: usize) -> anyhow::Result<()> {
    let store = client.store()?;
    store.open(&key);
    store.load_initial(&key).await?;
    for _ in 0..older {
        if store.load_older(&key).await? == 0 {
            break;
        }
    }

    for message in store.messages(&key) {
        let sender = message
            .sender
            .as_ref()
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| message.sender_id.clone());
        println!(
            "[{}] {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M"),
            sender,
            message.preview_text()
        );
    }
    if store.has_more(&key) {
        println!("(older messages available)");
    }
    Ok(())
}

fn print_previews(store: &Arc<MessageStore>) {
    for preview in store.previews().iter().take(5) {
        let unread = store.unread_count(&preview.key);
        println!("  {} ({}): {}", preview.key, unread, preview.text);
    }
}

fn theme(client: &VoxClient, value: Option<&str>) -> anyhow::Result<()> {
    if let Some(value) = value {
        let theme = Theme::parse(value).context("Theme must be light or dark")?;
        client.storage().set_theme(theme)?;
    }
    println!("{}", client.storage().theme()?.as_str());
    Ok(())
}

fn search(client: &VoxClient, query: Option<&str>) -> anyhow::Result<()> {
    if let Some(query) = query {
        client.storage().add_search(query)?;
    }
    for entry in client.storage().search_history()? {
        println!("{}", entry);
    }
    Ok(())
}
