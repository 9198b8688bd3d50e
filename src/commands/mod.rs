pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::moderation::ModerationStateMachine;
use crate::platform::{ChatPlatform, Event, Platform};

/// Everything a handler can see while handling one event.
pub struct CommandContext<'a> {
    pub event: &'a Event,
    /// Text after the command token; the whole text for the default handler
    pub args: &'a str,
    pub platform: &'a dyn ChatPlatform,
    pub moderation: &'a ModerationStateMachine,
}

/// A platform-scoped command. Returns the reply text, if any; the dispatcher
/// delivers it.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Option<String>>;
}

#[derive(Default)]
struct PlatformCommands {
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    default: Option<Arc<dyn CommandHandler>>,
}

/// Maps (platform, command name) to handlers, plus one default message
/// handler per platform. Names are case-insensitive.
#[derive(Default)]
pub struct CommandRegistry {
    platforms: HashMap<Platform, PlatformCommands>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Re-registering a name replaces the old handler.
    pub fn register(&mut self, platform: Platform, name: &str, handler: Arc<dyn CommandHandler>) {
        let name = name.to_lowercase();
        info!("Registered command '{}' for {}", name, platform);
        self.platforms
            .entry(platform)
            .or_default()
            .commands
            .insert(name, handler);
    }

    /// Register the handler for plain (non-command) messages.
    pub fn register_default(&mut self, platform: Platform, handler: Arc<dyn CommandHandler>) {
        info!("Registered default message handler for {}", platform);
        self.platforms.entry(platform).or_default().default = Some(handler);
    }

    pub fn resolve(&self, platform: Platform, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.platforms
            .get(&platform)?
            .commands
            .get(&name.to_lowercase())
            .cloned()
    }

    pub fn default_handler(&self, platform: Platform) -> Option<Arc<dyn CommandHandler>> {
        self.platforms.get(&platform)?.default.clone()
    }

    /// Whether anything at all is registered for `platform`.
    pub fn has_platform(&self, platform: Platform) -> bool {
        self.platforms
            .get(&platform)
            .is_some_and(|p| !p.commands.is_empty() || p.default.is_some())
    }

    /// Registered command names for `platform`, sorted.
    #[allow(dead_code)]
    pub fn list(&self, platform: Platform) -> Vec<String> {
        let mut names: Vec<String> = self
            .platforms
            .get(&platform)
            .map(|p| p.commands.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
