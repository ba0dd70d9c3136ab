use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use tg_postbot::config;
use tg_postbot::db::{self, seed, ChannelRepository, PostRepository};

#[derive(Debug, Parser)]
#[command(author, version, about = "Maintenance commands for the posting bot database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Apply pending migrations
    Migrate,
    /// Grant the admin role to a Telegram user (no-op when already granted)
    SeedAdmin {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        username: Option<String>,
    },
    /// Print table row counts and the default channel
    Check,
    /// Delete invalid channels and channels idle for the given number of days
    Cleanup {
        /// Defaults to `app.inactive_channel_days`
        #[arg(long)]
        days: Option<i64>,
    },
    /// List the newest posts
    Posts {
        #[arg(long, default_value = "10")]
        limit: i64,
        /// Print JSON instead of one line per post
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Cmd::Migrate => {
            info!("migrations applied");
            println!("Database is up to date.");
        }
        Cmd::SeedAdmin { user_id, username } => {
            let (user, granted) = seed::ensure_admin(&pool, user_id, username.as_deref())
                .await
                .context("seeding admin")?;
            if granted {
                println!("Granted admin to {}.", user.user_id);
            } else {
                println!("{} is already an admin.", user.user_id);
            }
        }
        Cmd::Check => {
            for (table, count) in db::table_counts(&pool).await? {
                println!("{table:<12} {count}");
            }
            match ChannelRepository::new(pool.clone()).get_default().await? {
                Some(channel) => {
                    println!("default channel: {} ({})", channel.title, channel.chat_id)
                }
                None => println!("default channel: none"),
            }
        }
        Cmd::Cleanup { days } => {
            let days = days.unwrap_or(cfg.app.inactive_channel_days as i64);
            let pruned = ChannelRepository::new(pool.clone())
                .prune(Utc::now() - Duration::days(days))
                .await
                .context("pruning channels")?;
            for channel in &pruned.invalid {
                println!("removed {} ({}): invalid", channel.title, channel.chat_id);
            }
            for channel in &pruned.inactive {
                println!("removed {} ({}): idle", channel.title, channel.chat_id);
            }
            println!(
                "{} channel(s) removed.",
                pruned.invalid.len() + pruned.inactive.len()
            );
        }
        Cmd::Posts { limit, json } => {
            let posts = PostRepository::new(pool.clone()).latest(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&posts)?);
            } else {
                for post in &posts {
                    println!(
                        "{:>5} {:<9} {} {}",
                        post.id,
                        post.status.as_str(),
                        post.created_date.format("%Y-%m-%d"),
                        post.title
                    );
                }
            }
        }
    }

    Ok(())
}
