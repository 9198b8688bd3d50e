pub mod dedup;

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandContext, CommandHandler, CommandRegistry};
use crate::moderation::{ModerationStateMachine, PrivateOutcome};
use crate::platform::{ChatPlatform, Event};

use self::dedup::DedupFilter;

const GENERIC_ERROR_REPLY: &str = "Sorry, something went wrong. Please contact an administrator.";

/// What happened to one dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Already dispatched within the dedup window; nothing was invoked
    Duplicate,
    /// A reply was produced (and a send attempted)
    Replied,
    /// Handled without a reply
    Silent,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub command_prefix: String,
    /// Reply with raw error text instead of the generic apology
    pub echo_errors: bool,
}

/// Routes inbound events to moderation or to the platform's command
/// handlers, at most once per event identifier.
pub struct Dispatcher {
    registry: CommandRegistry,
    dedup: DedupFilter,
    moderation: Arc<ModerationStateMachine>,
    settings: DispatchSettings,
}

/// Split `/cmd@BotName args` into (`cmd`, `args`).
fn parse_command<'a>(text: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    let rest = text.strip_prefix(prefix)?;
    let (token, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
        None => (rest, ""),
    };
    let name = token.split('@').next().unwrap_or(token);
    if name.is_empty() {
        return None;
    }
    Some((name.to_lowercase(), args))
}

impl Dispatcher {
    pub fn new(
        registry: CommandRegistry,
        dedup: DedupFilter,
        moderation: Arc<ModerationStateMachine>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            dedup,
            moderation,
            settings,
        }
    }

    /// Handle one inbound event. Never fails: handler errors are logged and
    /// turned into an apology to the sender.
    pub async fn dispatch(&self, event: &Event, platform: &dyn ChatPlatform) -> DispatchOutcome {
        let key = event.dedup_key();
        if let Some(key) = &key {
            if !self.dedup.try_begin(key).await {
                info!("Event {} already processed, skipping", key);
                return DispatchOutcome::Duplicate;
            }
        }

        let reply = match self.route(event, platform).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    "Error handling {} event from {}: {:#}",
                    event.platform, event.sender_id, e
                );
                Some(self.error_reply(&e))
            }
        };

        let outcome = match reply {
            Some(text) => {
                if let Err(e) = platform
                    .send_text(&event.chat_id, &text, event.message_id.as_deref())
                    .await
                {
                    error!("Failed to reply in {}: {}", event.chat_id, e);
                }
                DispatchOutcome::Replied
            }
            None => DispatchOutcome::Silent,
        };

        if let Some(key) = &key {
            self.dedup.finish(key).await;
        }
        outcome
    }

    async fn route(&self, event: &Event, platform: &dyn ChatPlatform) -> Result<Option<String>> {
        if platform.is_membership_join(event) {
            return Ok(self.moderation.on_join(event, platform).await);
        }

        if event.text.is_empty() {
            error!(
                "Unclassifiable {} event in {} (no text, not a join)",
                event.platform, event.chat_id
            );
            return Ok(None);
        }

        if platform.is_private(event) {
            match self.moderation.on_private_message(event, platform).await {
                PrivateOutcome::Reply(reply) => return Ok(Some(reply)),
                PrivateOutcome::PassThrough => {}
            }
        }

        if !self.registry.has_platform(event.platform) {
            warn!("No handlers registered for {}", event.platform);
            return Ok(None);
        }

        if let Some((name, args)) = parse_command(&event.text, &self.settings.command_prefix) {
            // Arguments of an unknown command are not meant for the fallback
            let (handler, args) = match self.registry.resolve(event.platform, &name) {
                Some(handler) => (Some(handler), args),
                None => {
                    debug!("Unknown command '{}', falling back to help", name);
                    let fallback = self
                        .registry
                        .resolve(event.platform, "help")
                        .or_else(|| self.registry.default_handler(event.platform));
                    (fallback, "")
                }
            };
            return match handler {
                Some(handler) => self.invoke(handler.as_ref(), event, platform, args).await,
                None => Ok(None),
            };
        }

        match self.registry.default_handler(event.platform) {
            Some(handler) => self.invoke(handler.as_ref(), event, platform, &event.text).await,
            None => Ok(None),
        }
    }

    async fn invoke(
        &self,
        handler: &dyn CommandHandler,
        event: &Event,
        platform: &dyn ChatPlatform,
        args: &str,
    ) -> Result<Option<String>> {
        let ctx = CommandContext {
            event,
            args,
            platform,
            moderation: &self.moderation,
        };
        handler.handle(&ctx).await
    }

    fn error_reply(&self, e: &anyhow::Error) -> String {
        if self.settings.echo_errors {
            format!("Error: {:#}", e)
        } else {
            GENERIC_ERROR_REPLY.to_string()
        }
    }
}
