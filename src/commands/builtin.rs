use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{CommandContext, CommandHandler, CommandRegistry};
use crate::platform::Platform;

const TELEGRAM_HELP: &[(&str, &str)] = &[
    ("start", "Start the bot"),
    ("help", "Show this help message"),
    ("hi", "Say hello"),
    ("pass", "Get today's password (private chat)"),
    ("content", "Show content list"),
    ("price", "Query price of top 10 in CoinMarketCap"),
    ("event", "Query community events info"),
    ("task", "Query community task info"),
    ("news", "Query news information"),
    ("PNTs", "Query PNTs balance and more info"),
    ("account", "Initiate a new AirAccount or get your AirAccount public info"),
    ("version", "Show bot version"),
];

const TWITTER_HELP: &[(&str, &str)] = &[
    ("start", "Start the bot"),
    ("help", "Show this help message"),
    ("hi", "Say hello"),
];

/// Business commands that are not implemented yet and answer with a stub.
const PLACEHOLDER_COMMANDS: &[&str] = &[
    "content", "price", "event", "task", "news", "PNTs", "account",
];

/// Register the command set for every platform.
pub fn register_builtin_commands(registry: &mut CommandRegistry, pass_private_only: bool) {
    let telegram = Platform::Telegram;
    registry.register(telegram, "start", Arc::new(StaticReply(
        "Hello! I'm your Telegram bot. How can I help you?",
    )));
    registry.register(telegram, "help", Arc::new(Help(TELEGRAM_HELP)));
    registry.register(telegram, "hi", Arc::new(Hi));
    registry.register(telegram, "pass", Arc::new(Pass { private_only: pass_private_only }));
    registry.register(telegram, "version", Arc::new(Version));
    for &name in PLACEHOLDER_COMMANDS {
        registry.register(telegram, name, Arc::new(Placeholder(name)));
    }
    registry.register_default(telegram, Arc::new(MentionReply));

    let twitter = Platform::Twitter;
    registry.register(twitter, "start", Arc::new(StaticReply(
        "Hello! I'm your Twitter bot. How can I help you?",
    )));
    registry.register(twitter, "help", Arc::new(Help(TWITTER_HELP)));
    registry.register(twitter, "hi", Arc::new(Hi));
    registry.register_default(twitter, Arc::new(StaticReply("I received your message!")));
}

struct StaticReply(&'static str);

#[async_trait]
impl CommandHandler for StaticReply {
    async fn handle(&self, _ctx: &CommandContext<'_>) -> Result<Option<String>> {
        Ok(Some(self.0.to_string()))
    }
}

struct Help(&'static [(&'static str, &'static str)]);

#[async_trait]
impl CommandHandler for Help {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let prefix = &ctx.moderation.settings().command_prefix;

        // `help <command>` describes just that command
        if let Some(wanted) = ctx.args.split_whitespace().next() {
            let wanted = wanted.strip_prefix(prefix.as_str()).unwrap_or(wanted);
            let reply = match self.0.iter().find(|(name, _)| name.eq_ignore_ascii_case(wanted)) {
                Some((name, description)) => format!("{}{} - {}", prefix, name, description),
                None => format!(
                    "Unknown command: {}. Send {}help for the full list.",
                    wanted, prefix
                ),
            };
            return Ok(Some(reply));
        }

        let mut text = String::from("Available commands:\n");
        for (name, description) in self.0 {
            text.push_str(&format!("{}{} - {}\n", prefix, name, description));
        }
        Ok(Some(text.trim_end().to_string()))
    }
}

struct Hi;

#[async_trait]
impl CommandHandler for Hi {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        Ok(Some(format!("Welcome {}! 👋", ctx.event.sender_name)))
    }
}

struct Pass {
    private_only: bool,
}

#[async_trait]
impl CommandHandler for Pass {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        if self.private_only && !ctx.platform.is_private(ctx.event) {
            return Ok(Some(
                "Please message the bot privately to get the password.".to_string(),
            ));
        }
        let password = ctx.moderation.current_password().await;
        info!("Sent daily password to user {}", ctx.event.sender_id);
        Ok(Some(format!("Today's password: {}", password.value)))
    }
}

struct Version;

#[async_trait]
impl CommandHandler for Version {
    async fn handle(&self, _ctx: &CommandContext<'_>) -> Result<Option<String>> {
        Ok(Some(format!("Bot version: {}", env!("CARGO_PKG_VERSION"))))
    }
}

struct Placeholder(&'static str);

#[async_trait]
impl CommandHandler for Placeholder {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        Ok(Some(format!(
            "Hi {}, I got your function call: {}",
            ctx.event.sender_name, self.0
        )))
    }
}

/// Replies when the bot is mentioned; other chatter is only logged.
struct MentionReply;

#[async_trait]
impl CommandHandler for MentionReply {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        if !ctx.event.mentions_bot {
            info!(
                "Message from {} in {}: {}",
                ctx.event.sender_name, ctx.event.chat_id, ctx.event.text
            );
            return Ok(None);
        }
        Ok(Some(format!(
            "Hi {}, I got your message: {}",
            ctx.event.sender_name, ctx.event.text
        )))
    }
}
