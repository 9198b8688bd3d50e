pub mod guard;
#[cfg(test)]
pub mod mock;
pub mod telegram;
pub mod twitter;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::PlatformError;

/// Which chat-platform adapter an event or handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Twitter,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Telegram => write!(f, "telegram"),
            Platform::Twitter => write!(f, "twitter"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telegram" => Ok(Platform::Telegram),
            "twitter" => Ok(Platform::Twitter),
            other => Err(other.to_string()),
        }
    }
}

/// An inbound unit of work, produced by a platform adapter.
/// Read-only to the core; discarded after dispatch.
#[derive(Debug, Clone)]
pub struct Event {
    pub platform: Platform,
    /// Chat/group the event happened in (for private chats, the DM chat)
    pub chat_id: String,
    /// Platform message id; `None` when the platform gave no stable id
    pub message_id: Option<String>,
    pub sender_id: String,
    /// Display name of the sender (first name, screen name, ...)
    pub sender_name: String,
    pub text: String,
    pub is_private: bool,
    pub is_membership_join: bool,
    pub mentions_bot: bool,
}

impl Event {
    /// Stable composite identifier used for deduplication. One service
    /// message can announce several joins, so join keys carry the member.
    pub fn dedup_key(&self) -> Option<String> {
        self.message_id.as_ref().map(|id| {
            if self.is_membership_join {
                format!("{}:{}:{}:join:{}", self.platform, self.chat_id, id, self.sender_id)
            } else {
                format!("{}:{}:{}", self.platform, self.chat_id, id)
            }
        })
    }
}

/// A resolved chat/user/channel on a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub name: String,
}

/// An in-memory file sent alongside a message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Narrow capability interface the core uses to talk to a chat platform.
/// Session handling, auth and wire formats stay inside the implementations.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn platform(&self) -> Platform;

    /// Establish the session. Returns false if the platform is unreachable
    /// or rejected the credentials.
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    async fn get_entity(&self, name: &str) -> Result<Entity, PlatformError>;

    /// Send a text message and return the new message id.
    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError>;

    async fn send_with_attachment(
        &self,
        target: &str,
        text: &str,
        attachment: &Attachment,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError>;

    /// Restrict `user` from posting in `group`, until `until` if given.
    async fn mute(
        &self,
        group: &str,
        user: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), PlatformError>;

    async fn unmute(&self, group: &str, user: &str) -> Result<(), PlatformError>;

    fn is_private(&self, event: &Event) -> bool {
        event.is_private
    }

    fn is_membership_join(&self, event: &Event) -> bool {
        event.is_membership_join
    }
}

/// Every connected platform, keyed by tag.
pub type Platforms = HashMap<Platform, Arc<dyn ChatPlatform>>;
