use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use server_api::config::{load_settings, Settings};
use shared::domain::{AccountIndex, SlotKey, UserId};
use storage::{AccountDirectory, MediaLayout};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Offline maintenance of linked-account sessions and their media cache.
#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `sessions_root` from settings.
    #[arg(long)]
    sessions_root: Option<PathBuf>,
    /// Overrides `media_root` from settings.
    #[arg(long)]
    media_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists the persisted account slots of a user.
    Slots {
        #[arg(long)]
        user: String,
    },
    /// Deletes a slot's Session File and cached media without remote logout.
    Purge {
        #[arg(long)]
        user: String,
        #[arg(long)]
        index: u32,
    },
    /// Reports cached bytes per media namespace for a slot.
    CacheUsage {
        #[arg(long)]
        user: String,
        #[arg(long)]
        index: u32,
    },
}

struct Layout {
    directory: AccountDirectory,
    media: MediaLayout,
}

impl Layout {
    fn resolve(cli: &Cli, settings: &Settings) -> Self {
        let core = settings.core_config();
        let sessions_root = cli.sessions_root.clone().unwrap_or(core.sessions_root);
        let media_root = cli.media_root.clone().unwrap_or(core.media_root);
        Self {
            directory: AccountDirectory::new(sessions_root),
            media: MediaLayout::new(media_root, core.public_media_prefix),
        }
    }
}

fn slot_key(user: &str, index: u32) -> Result<SlotKey> {
    if index == 0 {
        bail!("account indices start at 1");
    }
    Ok(SlotKey::new(UserId::from(user), AccountIndex(index)))
}

async fn run(cli: Cli, layout: Layout) -> Result<()> {
    match cli.command {
        Command::Slots { user } => {
            let user_id = UserId::from(user.as_str());
            let slots = layout.directory.list_slots(&user_id).await?;
            if slots.is_empty() {
                println!("no slots for user={user_id}");
            }
            for index in slots {
                let slot = SlotKey::new(user_id.clone(), index);
                let session = layout.directory.session_file(&slot)?.load().await;
                match session {
                    Ok(Some(session)) => println!(
                        "{slot} remote_user_id={} updated_at={}",
                        session
                            .remote_user_id
                            .map_or_else(|| "-".to_string(), |id| id.to_string()),
                        session.updated_at.to_rfc3339()
                    ),
                    Ok(None) => println!("{slot} (empty session file)"),
                    Err(err) => println!("{slot} unreadable: {err:#}"),
                }
            }
        }
        Command::Purge { user, index } => {
            let slot = slot_key(&user, index)?;
            let removed = layout.directory.remove_session_file(&slot).await?;
            layout.media.purge_slot(&slot).await?;
            info!(slot = %slot, session_file_removed = removed, "slot purged");
            println!("purged {slot} (session file removed: {removed})");
        }
        Command::CacheUsage { user, index } => {
            let slot = slot_key(&user, index)?;
            let mut total = 0;
            for (namespace, bytes) in layout.media.usage(&slot).await? {
                total += bytes;
                println!("{:<10} {bytes}", namespace.dir_name());
            }
            println!("{:<10} {total}", "total");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = load_settings();
    let layout = Layout::resolve(&cli, &settings);
    run(cli, layout).await
}
