mod commands;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use muster_chat::{ChatConfig, ChatSession, Composer, FeedView, FsBlobStore, MemoryBackend};
use muster_types::{ChannelKey, Identity};

use commands::{Command, HELP, parse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so they don't interleave with the feed
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "muster=info".into()),
        )
        .init();

    // Config
    let config = ChatConfig::from_env()?;
    let blob_dir = std::env::var("MUSTER_BLOB_DIR").unwrap_or_else(|_| "blobs".into());
    let actor_name = std::env::var("MUSTER_ACTOR_NAME").unwrap_or_else(|_| "operator".into());
    let elevated = std::env::var("MUSTER_ELEVATED")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    let channel = std::env::var("MUSTER_CHANNEL").unwrap_or_else(|_| "general".into());

    let identity = Identity {
        actor_id: Uuid::new_v4(),
        display_name: actor_name,
        avatar: None,
        elevated,
    };

    let blobs = FsBlobStore::new(PathBuf::from(&blob_dir)).await?;
    let session = ChatSession::open(identity, config, Arc::new(MemoryBackend::new()), Arc::new(blobs));
    session.switch_channel(ChannelKey::new(channel))?;

    info!("muster ready as {}", session.identity().display_name);
    println!("{HELP}");

    let mut composer = Composer::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = run(&session, &mut composer, command).await {
            println!("error: {e}");
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn run(session: &ChatSession, composer: &mut Composer, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Post(text) => {
            composer.set_text(text);
            session.submit(composer).await?;
        }
        Command::Join(channel) => {
            session.switch_channel(ChannelKey::new(channel))?;
            return Ok(());
        }
        Command::Channels => {
            for channel in session.config().catalog.channels() {
                println!("#{:<14} {}", channel.key.as_str(), channel.description);
            }
            return Ok(());
        }
        Command::Feed => {}
        Command::React(n, emoji) => {
            let id = entry(session, n)?;
            session.toggle_reaction(id, &emoji).await?;
        }
        Command::Reply(n) => {
            composer.reply_to(entry(session, n)?);
            println!("replying to entry {n}");
            return Ok(());
        }
        Command::Attach(path) => {
            let bytes = tokio::fs::read(&path).await?;
            let filename = Path::new(&path)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(&path)
                .to_string();
            composer.attach(filename, Bytes::from(bytes));
            println!("attached {path}, post to send");
            return Ok(());
        }
        Command::Edit(n, text) => {
            session.edit_message(entry(session, n)?, &text).await?;
        }
        Command::Delete(n) => {
            session.delete_message(entry(session, n)?).await?;
        }
        Command::Help => {
            println!("{HELP}");
            return Ok(());
        }
        Command::Quit => return Ok(()),
    }

    // Let the session apply the write before rendering
    tokio::task::yield_now().await;
    print_feed(&session.current_view());
    Ok(())
}

fn entry(session: &ChatSession, n: usize) -> anyhow::Result<Uuid> {
    session
        .current_view()
        .items
        .get(n - 1)
        .map(|item| item.message.id)
        .ok_or_else(|| anyhow::anyhow!("no entry {n} in the feed"))
}

fn print_feed(view: &FeedView) {
    let Some(channel) = &view.channel else {
        println!("(no channel)");
        return;
    };
    let status = match (view.loading, view.connected) {
        (true, _) => " loading",
        (false, false) => " offline",
        (false, true) => "",
    };
    println!("── #{channel}{status} ──");
    if let Some(e) = &view.error {
        warn!("Feed error: {}", e);
        println!("! {e}");
    }

    for (i, item) in view.items.iter().enumerate() {
        if item.show_header {
            println!(
                "{} · {}",
                item.message.author.display_name,
                item.message.created_at.format("%H:%M")
            );
        }
        if let Some(reply) = &item.reply {
            println!("     ↳ {}", reply.label());
        }
        let edited = if item.message.edited_at.is_some() && !item.message.deleted {
            " (edited)"
        } else {
            ""
        };
        println!("{:>3}  {}{}", i + 1, item.body_text(), edited);
        if let Some(attachment) = &item.message.attachment {
            println!("     📎 {} <{}>", attachment.filename, attachment.url);
        }
        if !item.reactions.is_empty() {
            let reactions: Vec<String> = item
                .reactions
                .iter()
                .map(|g| format!("{}{}{}", g.emoji, g.count, if g.mine { "*" } else { "" }))
                .collect();
            println!("     {}", reactions.join(" "));
        }
    }
}
