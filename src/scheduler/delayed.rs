use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::platform::{Attachment, ChatPlatform, Platform};

/// Content of a scheduled send.
#[derive(Debug, Clone)]
pub struct Payload {
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }
}

/// An accepted scheduled send.
#[derive(Debug, Clone)]
pub struct ScheduledSend {
    pub id: Uuid,
    pub platform: Platform,
    pub target: String,
    pub fire_at: DateTime<Utc>,
}

/// One-shot delayed sends. Each accepted send is a tokio task tracked by id
/// until it fires, so pending sends can be cancelled and are not leaked at
/// shutdown.
#[derive(Clone, Default)]
pub struct DelayedSender {
    pending: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
}

impl DelayedSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot send of `payload` to `target` at `fire_at`.
    ///
    /// Rejected synchronously, without arming anything, when `fire_at` is
    /// not in the future or the request is incomplete.
    pub async fn schedule_send(
        &self,
        platform: Arc<dyn ChatPlatform>,
        target: &str,
        payload: Payload,
        fire_at: DateTime<Utc>,
    ) -> Result<ScheduledSend, ScheduleError> {
        if target.trim().is_empty() {
            return Err(ScheduleError::MissingField("target"));
        }
        if payload.text.trim().is_empty() && payload.attachment.is_none() {
            return Err(ScheduleError::MissingField("message"));
        }
        let delay = (fire_at - Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or(ScheduleError::NotInFuture)?;

        let id = Uuid::new_v4();
        let scheduled = ScheduledSend {
            id,
            platform: platform.platform(),
            target: target.to_string(),
            fire_at,
        };

        // Hold the write lock across spawn so the task cannot remove its
        // entry before it is inserted.
        let mut pending = self.pending.write().await;
        let registry = self.pending.clone();
        let target = target.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = match &payload.attachment {
                Some(attachment) => {
                    platform
                        .send_with_attachment(&target, &payload.text, attachment, None)
                        .await
                }
                None => platform.send_text(&target, &payload.text, None).await,
            };
            match result {
                Ok(message_id) => info!(
                    "Scheduled send {} delivered to {} on {} (message {})",
                    id,
                    target,
                    platform.platform(),
                    message_id
                ),
                Err(e) => error!("Scheduled send {} to {} failed: {}", id, target, e),
            }
            registry.write().await.remove(&id);
        });
        pending.insert(id, handle);

        info!(
            "Scheduled send {} to {} on {} at {} (in {:?})",
            id, scheduled.target, scheduled.platform, fire_at, delay
        );
        Ok(scheduled)
    }

    /// Cancel a pending send. Returns false if it already fired or is unknown.
    #[allow(dead_code)]
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.pending.write().await.remove(&id) {
            Some(handle) => {
                handle.abort();
                info!("Cancelled scheduled send {}", id);
                true
            }
            None => false,
        }
    }

    /// Number of sends that have not fired yet.
    pub async fn pending(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Abort every pending send.
    pub async fn shutdown(&self) {
        let mut pending = self.pending.write().await;
        if !pending.is_empty() {
            debug!("Cancelling {} pending scheduled send(s)", pending.len());
        }
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }
}
