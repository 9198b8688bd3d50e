use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, ChatPermissions, InputFile, MessageId, Recipient, ReplyParameters, User, UserId,
};
use teloxide::RequestError;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Attachment, ChatPlatform, Entity, Event, Platform};
use crate::dispatch::Dispatcher;
use crate::error::PlatformError;

/// Telegram rejects messages longer than 4096 characters
const MAX_MESSAGE_LEN: usize = 4000;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Numeric chat ids go out as-is, `@name` as a public username.
fn recipient(target: &str) -> Result<Recipient, PlatformError> {
    let target = target.trim();
    if let Ok(id) = target.parse::<i64>() {
        return Ok(Recipient::Id(ChatId(id)));
    }
    if target.len() > 1 && target.starts_with('@') {
        return Ok(Recipient::ChannelUsername(target.to_string()));
    }
    Err(PlatformError::InvalidTarget(target.to_string()))
}

fn user_id(user: &str) -> Result<UserId, PlatformError> {
    user.trim()
        .parse::<u64>()
        .map(UserId)
        .map_err(|_| PlatformError::InvalidTarget(user.to_string()))
}

fn message_id(id: &str) -> Result<MessageId, PlatformError> {
    id.parse::<i32>()
        .map(MessageId)
        .map_err(|_| PlatformError::InvalidTarget(id.to_string()))
}

fn api_error(e: RequestError) -> PlatformError {
    PlatformError::Api {
        platform: Platform::Telegram,
        reason: e.to_string(),
    }
}

/// Telegram Bot API adapter.
pub struct TelegramPlatform {
    bot: Bot,
    /// Learned from `getMe` unless configured
    username: RwLock<Option<String>>,
}

impl TelegramPlatform {
    pub fn new(token: &str, username: Option<String>) -> Self {
        Self {
            bot: Bot::new(token),
            username: RwLock::new(username.map(|u| u.trim_start_matches('@').to_string())),
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    pub async fn username(&self) -> Option<String> {
        self.username.read().await.clone()
    }
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn connect(&self) -> bool {
        match self.bot.get_me().await {
            Ok(me) => {
                let mut username = self.username.write().await;
                if username.is_none() {
                    *username = me.user.username.clone();
                }
                info!(
                    "Connected to Telegram as {} (@{})",
                    me.user.first_name,
                    username.as_deref().unwrap_or("?")
                );
                true
            }
            Err(e) => {
                warn!("Telegram getMe failed: {}", e);
                false
            }
        }
    }

    async fn disconnect(&self) {
        // Bot API is stateless HTTP; nothing to tear down
        debug!("Telegram platform disconnected");
    }

    async fn get_entity(&self, name: &str) -> Result<Entity, PlatformError> {
        let chat = self.bot.get_chat(recipient(name)?).await.map_err(api_error)?;
        let display = chat
            .title()
            .or_else(|| chat.username())
            .or_else(|| chat.first_name())
            .unwrap_or(name)
            .to_string();
        Ok(Entity {
            id: chat.id.0.to_string(),
            name: display,
        })
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        let chat = recipient(target)?;
        let reply_to = reply_to.map(message_id).transpose()?;

        let mut last_id = None;
        for (i, chunk) in split_message(text, MAX_MESSAGE_LEN).into_iter().enumerate() {
            let mut request = self.bot.send_message(chat.clone(), chunk);
            if let (0, Some(id)) = (i, reply_to) {
                request = request.reply_parameters(ReplyParameters::new(id));
            }
            let sent = request.await.map_err(api_error)?;
            last_id = Some(sent.id);
        }
        last_id
            .map(|id| id.0.to_string())
            .ok_or_else(|| PlatformError::InvalidTarget("empty message".to_string()))
    }

    async fn send_with_attachment(
        &self,
        target: &str,
        text: &str,
        attachment: &Attachment,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        let photo = InputFile::memory(attachment.bytes.clone()).file_name(attachment.file_name.clone());
        let mut request = self.bot.send_photo(recipient(target)?, photo);
        if !text.is_empty() {
            request = request.caption(text);
        }
        if let Some(id) = reply_to.map(message_id).transpose()? {
            request = request.reply_parameters(ReplyParameters::new(id));
        }
        let sent = request.await.map_err(api_error)?;
        Ok(sent.id.0.to_string())
    }

    async fn mute(
        &self,
        group: &str,
        user: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), PlatformError> {
        let mut request =
            self.bot
                .restrict_chat_member(recipient(group)?, user_id(user)?, ChatPermissions::empty());
        if let Some(until) = until {
            request = request.until_date(until);
        }
        request.await.map_err(api_error)?;
        Ok(())
    }

    async fn unmute(&self, group: &str, user: &str) -> Result<(), PlatformError> {
        self.bot
            .restrict_chat_member(recipient(group)?, user_id(user)?, ChatPermissions::all())
            .await
            .map_err(api_error)?;
        Ok(())
    }
}

#[derive(Clone)]
struct BotUsername(Option<String>);

fn mentions(text: &str, username: Option<&str>) -> bool {
    username.is_some_and(|name| {
        text.to_lowercase()
            .contains(&format!("@{}", name.to_lowercase()))
    })
}

/// Convert one Telegram message into core events. A service message that
/// adds several members yields one join event per member.
fn events_from_message(msg: &Message, username: Option<&str>) -> Vec<Event> {
    let chat_id = msg.chat.id.0.to_string();
    let is_private = msg.chat.is_private();

    if let Some(members) = msg.new_chat_members() {
        return members
            .iter()
            .filter(|u| !u.is_bot)
            .map(|u| Event {
                platform: Platform::Telegram,
                chat_id: chat_id.clone(),
                message_id: Some(msg.id.0.to_string()),
                sender_id: u.id.0.to_string(),
                sender_name: display_name(u),
                text: String::new(),
                is_private,
                is_membership_join: true,
                mentions_bot: false,
            })
            .collect();
    }

    let Some(user) = msg.from.as_ref() else {
        return Vec::new();
    };
    let Some(text) = msg.text().or_else(|| msg.caption()) else {
        return Vec::new();
    };

    vec![Event {
        platform: Platform::Telegram,
        chat_id,
        message_id: Some(msg.id.0.to_string()),
        sender_id: user.id.0.to_string(),
        sender_name: display_name(user),
        text: text.to_string(),
        is_private,
        is_membership_join: false,
        mentions_bot: mentions(text, username),
    }]
}

fn display_name(user: &User) -> String {
    user.first_name.clone()
}

/// Receive Telegram updates until the task is aborted, routing each message
/// through `router`. Replies go out through `platform`.
pub async fn listen(
    bot: Bot,
    username: Option<String>,
    router: Arc<Dispatcher>,
    platform: Arc<dyn ChatPlatform>,
) {
    info!("Starting Telegram listener...");

    let handler = Update::filter_message().endpoint(handle_message);

    teloxide::dispatching::Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![router, platform, BotUsername(username)])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .build()
        .dispatch()
        .await;
}

async fn handle_message(
    msg: Message,
    router: Arc<Dispatcher>,
    platform: Arc<dyn ChatPlatform>,
    username: BotUsername,
) -> ResponseResult<()> {
    for event in events_from_message(&msg, username.0.as_deref()) {
        debug!(
            "Telegram event in {} from {} ({})",
            event.chat_id, event.sender_name, event.sender_id
        );
        router.dispatch(&event, platform.as_ref()).await;
    }
    Ok(())
}
