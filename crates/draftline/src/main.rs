//! `draftline` - inspect and maintain local draft sync state.
//!
//! Usage: `draftline <command> [user-id] [message-id]`

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use draftline_core::{
    Config, Database, DraftStateRepository, MessageId, OutboxRepository, SendingStatusObserver,
    UserId,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "draftline", version, about = "Inspect and maintain local draft sync state")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List draft sync states
    Drafts {
        /// Account owning the drafts
        #[arg(value_parser = parse_user_id)]
        user_id: UserId,
    },
    /// List messages in the outbox
    Outbox {
        /// Account owning the drafts
        #[arg(value_parser = parse_user_id)]
        user_id: UserId,
    },
    /// Print the outbox on every change
    WatchOutbox {
        /// Account owning the drafts
        #[arg(value_parser = parse_user_id)]
        user_id: UserId,
    },
    /// Acknowledge reported send outcomes
    Confirm {
        /// Account owning the drafts
        #[arg(value_parser = parse_user_id)]
        user_id: UserId,
    },
    /// Forget the sync state of a draft
    Discard {
        /// Account owning the drafts
        #[arg(value_parser = parse_user_id)]
        user_id: UserId,
        /// Local message id of the draft
        #[arg(value_parser = parse_message_id)]
        message_id: MessageId,
    },
    /// Print the effective configuration
    Config,
}

fn parse_user_id(value: &str) -> Result<UserId, String> {
    if value.is_empty() {
        return Err("user id must not be empty".to_string());
    }
    Ok(UserId::new(value))
}

fn parse_message_id(value: &str) -> Result<MessageId, String> {
    if value.is_empty() {
        return Err("message id must not be empty".to_string());
    }
    Ok(MessageId::new(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "draftline=info,draftline_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { command } = Cli::parse();

    let config_path = Config::default_path();
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if matches!(command, Command::Config) {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let database_path = config.database_path();
    if let Some(parent) = database_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    info!(path = %database_path.display(), "opening database");
    let db = Database::new(&database_path.to_string_lossy())
        .await
        .context("failed to open database")?;
    let drafts = DraftStateRepository::with_config(db.clone(), &config.store);

    match command {
        Command::Drafts { user_id } => {
            for state in drafts.list_for_user(&user_id).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    state.message_id,
                    state.state,
                    state
                        .api_message_id
                        .as_ref()
                        .map_or("-", MessageId::as_str),
                    state.updated_at.to_rfc3339(),
                );
            }
        }
        Command::Outbox { user_id } => {
            for message_id in OutboxRepository::new(db).outbox(&user_id).await? {
                println!("{message_id}");
            }
        }
        Command::WatchOutbox { user_id } => {
            let mut subscription = OutboxRepository::new(db).observe_outbox(&user_id);
            loop {
                tokio::select! {
                    outbox = subscription.next() => {
                        let ids: Vec<_> = outbox?.iter().map(ToString::to_string).collect();
                        println!("[{}]", ids.join(", "));
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Confirm { user_id } => {
            let confirmed = SendingStatusObserver::new(drafts)
                .confirm_sending_status(&user_id)
                .await?;
            println!("confirmed {confirmed} sending status(es)");
        }
        Command::Discard {
            user_id,
            message_id,
        } => {
            drafts.delete(&user_id, &message_id).await?;
            info!(%user_id, %message_id, "draft state discarded");
        }
        Command::Config => {}
    }

    Ok(())
}
