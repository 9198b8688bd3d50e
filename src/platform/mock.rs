//! Recording `ChatPlatform` used by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Attachment, ChatPlatform, Entity, Platform};
use crate::error::PlatformError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Send {
        target: String,
        text: String,
        reply_to: Option<String>,
    },
    Mute {
        group: String,
        user: String,
        until: Option<DateTime<Utc>>,
    },
    Unmute {
        group: String,
        user: String,
    },
}

pub struct MockPlatform {
    platform: Platform,
    calls: Mutex<Vec<Call>>,
    pub fail_mute: AtomicBool,
    pub fail_unmute: AtomicBool,
    pub fail_send: AtomicBool,
    /// Artificial latency applied to every send
    pub send_delay: Mutex<Option<Duration>>,
}

impl MockPlatform {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            calls: Mutex::new(Vec::new()),
            fail_mute: AtomicBool::new(false),
            fail_unmute: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            send_delay: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { target, text, .. } => Some((target, text)),
                _ => None,
            })
            .collect()
    }

    pub fn mutes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Mute { .. }))
            .collect()
    }

    pub fn unmutes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Unmute { .. }))
            .collect()
    }

    fn api_error(&self, op: &str) -> PlatformError {
        PlatformError::Api {
            platform: self.platform,
            reason: format!("{} rejected", op),
        }
    }
}

#[async_trait]
impl ChatPlatform for MockPlatform {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn connect(&self) -> bool {
        true
    }

    async fn disconnect(&self) {}

    async fn get_entity(&self, name: &str) -> Result<Entity, PlatformError> {
        Ok(Entity {
            id: name.to_string(),
            name: name.to_string(),
        })
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(self.api_error("send"));
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(Call::Send {
            target: target.to_string(),
            text: text.to_string(),
            reply_to: reply_to.map(str::to_string),
        });
        Ok(calls.len().to_string())
    }

    async fn send_with_attachment(
        &self,
        target: &str,
        text: &str,
        _attachment: &Attachment,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        self.send_text(target, text, reply_to).await
    }

    async fn mute(
        &self,
        group: &str,
        user: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), PlatformError> {
        self.calls.lock().unwrap().push(Call::Mute {
            group: group.to_string(),
            user: user.to_string(),
            until,
        });
        if self.fail_mute.load(Ordering::SeqCst) {
            return Err(self.api_error("mute"));
        }
        Ok(())
    }

    async fn unmute(&self, group: &str, user: &str) -> Result<(), PlatformError> {
        self.calls.lock().unwrap().push(Call::Unmute {
            group: group.to_string(),
            user: user.to_string(),
        });
        if self.fail_unmute.load(Ordering::SeqCst) {
            return Err(self.api_error("unmute"));
        }
        Ok(())
    }
}
