//! Crosspost: republish X/Twitter posts to a Telegram channel.
//!
//! Main binary with subcommands:
//! - `run`: the bot (update poller, publish queue)
//! - `status`: print the queue summary and exit
//! - `clear`: empty the queue and exit

use std::path::{Path, PathBuf};

use chrono::FixedOffset;
use clap::{Args, Parser, Subcommand};
use crosspost_queue::JobStore;
use crosspost_telegram::ChatId;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;
mod handler;
mod scratch;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

/// Parse a UTC offset such as `+03:00` or `-0530`. `UTC` and `Z` mean zero.
fn parse_utc_offset(s: &str) -> Result<FixedOffset, String> {
    let s = match s.trim() {
        zero if zero.eq_ignore_ascii_case("z") || zero.eq_ignore_ascii_case("utc") => "+00:00",
        offset => offset,
    };
    s.parse::<FixedOffset>()
        .map_err(|e| format!("invalid UTC offset '{}' ({}), expected e.g. +03:00", s, e))
}

#[derive(Parser)]
#[command(name = "crosspost")]
#[command(about = "Republish X/Twitter posts to a Telegram channel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the queue lives.
#[derive(Args)]
struct StorageArgs {
    /// Scratch directory for downloaded media
    #[arg(long, env = "TEMP_DIR", default_value = ".tmp")]
    temp_dir: PathBuf,

    /// Queue database (defaults to <temp-dir>/queue.sqlite)
    #[arg(long, env = "QUEUE_DB_PATH")]
    queue_db: Option<PathBuf>,
}

impl StorageArgs {
    fn queue_db(&self) -> PathBuf {
        self.queue_db
            .clone()
            .unwrap_or_else(|| self.temp_dir.join("queue.sqlite"))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot
    Run {
        /// Telegram bot token
        #[arg(long, env = "TELEGRAM_BOT_TOKEN")]
        telegram_bot_token: String,

        /// Channel to publish to (numeric id or @username)
        #[arg(long, env = "TELEGRAM_TARGET_CHANNEL_ID")]
        telegram_channel_id: ChatId,

        /// X/Twitter API bearer token
        #[arg(long, env = "TWITTER_BEARER_TOKEN")]
        twitter_bearer_token: String,

        /// Proxy for all X/Twitter traffic
        #[arg(long, env = "TWITTER_PROXY_URL")]
        twitter_proxy_url: Option<String>,

        #[command(flatten)]
        storage: StorageArgs,

        /// Total attempts per post, the first one included, before it is
        /// dropped. Rate-limit deferrals do not count.
        #[arg(long = "max-retries", env = "MAX_RETRIES", default_value = "3")]
        max_attempts: u32,

        /// Seconds added to the retry delay after every failure
        #[arg(long, env = "RETRY_INCREMENT_SECS", default_value = "10")]
        retry_increment_secs: u32,

        /// Drop posts without media instead of publishing their text.
        /// Accepts 1/true/yes/on or 0/false/no/off.
        #[arg(long, env = "REQUIRE_MEDIA", action = clap::ArgAction::Set, value_parser = parse_bool_env, default_value = "true")]
        require_media: bool,

        /// Placeholder in the caption replaced by the quoted source text
        #[arg(long, env = "QUOTE_MARKER", default_value = "%quote%")]
        quote_marker: String,

        /// UTC offset used for times in notifications
        #[arg(long, env = "NOTIFY_UTC_OFFSET", value_parser = parse_utc_offset, default_value = "+03:00")]
        notify_utc_offset: FixedOffset,

        /// Long-poll timeout for Telegram updates in seconds
        #[arg(long, default_value = "30")]
        poll_timeout_secs: u64,
    },

    /// Print the queue summary. Run it while the bot is stopped.
    Status {
        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Delete every queued post. Run it while the bot is stopped.
    Clear {
        #[command(flatten)]
        storage: StorageArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "crosspost=info,crosspost_queue=info,crosspost_twitter=info,crosspost_telegram=info"
                    .to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            telegram_bot_token,
            telegram_channel_id,
            twitter_bearer_token,
            twitter_proxy_url,
            storage,
            max_attempts,
            retry_increment_secs,
            require_media,
            quote_marker,
            notify_utc_offset,
            poll_timeout_secs,
        } => {
            let queue_db = storage.queue_db();
            daemon::run(daemon::DaemonConfig {
                telegram_bot_token,
                telegram_channel: telegram_channel_id,
                twitter_bearer_token,
                twitter_proxy_url: twitter_proxy_url.filter(|url| !url.is_empty()),
                temp_dir: storage.temp_dir,
                queue_db,
                max_attempts,
                retry_increment_secs,
                require_media,
                quote_marker,
                notify_offset: notify_utc_offset,
                poll_timeout_secs,
            })
            .await
        }

        Commands::Status { storage } => print_status(&storage.queue_db()),

        Commands::Clear { storage } => {
            let store = open_store(&storage.queue_db())?;
            let removed = store
                .clear_all()
                .map_err(|e| miette::miette!("failed to clear queue: {}", e))?;
            println!("Removed {removed} queued posts");
            Ok(())
        }
    }
}

fn open_store(path: &Path) -> Result<JobStore> {
    JobStore::open(path)
        .map_err(|e| miette::miette!("failed to open job store {}: {}", path.display(), e))
}

fn print_status(path: &Path) -> Result<()> {
    let store = open_store(path)?;
    let summary = store
        .status_summary()
        .map_err(|e| miette::miette!("failed to read queue: {}", e))?;

    if summary.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for group in summary {
        let next = group
            .next_available_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:>5} jobs  max retries {:>3}  next {}",
            group.status, group.count, group.max_retry_count, next
        );
    }
    Ok(())
}
