mod bot;
mod commands;
mod config;
mod dispatch;
mod error;
mod moderation;
mod password;
mod platform;
mod scheduler;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::BotService;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,modbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Moderation: {}", config.moderation.enabled);
    info!("  Default group: {}", config.default_group().unwrap_or("(none)"));
    info!("  Twitter: {}", config.twitter.is_some());
    info!("  Scheduled messages: {}", config.scheduled_messages.len());

    info!("Bot {} is starting...", env!("CARGO_PKG_VERSION"));
    BotService::new(config).run().await?;

    Ok(())
}
