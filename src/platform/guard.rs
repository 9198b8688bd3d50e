use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use super::{Attachment, ChatPlatform, Entity, Event, Platform};
use crate::error::PlatformError;

/// Wraps a platform so that every call is bounded by a timeout and sends to
/// the same destination go out one at a time, in the order they were issued.
pub struct GuardedPlatform {
    inner: Arc<dyn ChatPlatform>,
    timeout: Duration,
    /// One lock per destination with a send queued or in flight
    destinations: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GuardedPlatform {
    pub fn new(inner: Arc<dyn ChatPlatform>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            destinations: Mutex::new(HashMap::new()),
        }
    }

    async fn destination_lock(&self, target: &str) -> Arc<Mutex<()>> {
        let mut destinations = self.destinations.lock().await;
        destinations
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `send` holding the destination's turn, then drop the destination
    /// entry if no other send is waiting on it.
    async fn in_turn<T, F>(&self, target: &str, send: F) -> Result<T, PlatformError>
    where
        F: Future<Output = Result<T, PlatformError>>,
    {
        let lock = self.destination_lock(target).await;
        let result = {
            let _turn = lock.lock().await;
            send.await
        };

        let mut destinations = self.destinations.lock().await;
        // Only the map and this call still reference the lock
        let idle = destinations
            .get(target)
            .is_some_and(|current| Arc::ptr_eq(current, &lock))
            && Arc::strong_count(&lock) == 2;
        if idle {
            destinations.remove(target);
        }
        result
    }

    #[cfg(test)]
    async fn destination_count(&self) -> usize {
        self.destinations.lock().await.len()
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, PlatformError>
    where
        F: Future<Output = Result<T, PlatformError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} {} exceeded {:?}",
                    self.inner.platform(),
                    operation,
                    self.timeout
                );
                Err(PlatformError::Timeout {
                    platform: self.inner.platform(),
                    operation,
                    after: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl ChatPlatform for GuardedPlatform {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    async fn connect(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.inner.connect()).await {
            Ok(connected) => connected,
            Err(_) => {
                warn!("{} connect timed out", self.inner.platform());
                false
            }
        }
    }

    async fn disconnect(&self) {
        if tokio::time::timeout(self.timeout, self.inner.disconnect())
            .await
            .is_err()
        {
            warn!("{} disconnect timed out", self.inner.platform());
        }
    }

    async fn get_entity(&self, name: &str) -> Result<Entity, PlatformError> {
        self.bounded("get_entity", self.inner.get_entity(name)).await
    }

    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        self.in_turn(
            target,
            self.bounded("send_text", self.inner.send_text(target, text, reply_to)),
        )
        .await
    }

    async fn send_with_attachment(
        &self,
        target: &str,
        text: &str,
        attachment: &Attachment,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        self.in_turn(
            target,
            self.bounded(
                "send_with_attachment",
                self.inner
                    .send_with_attachment(target, text, attachment, reply_to),
            ),
        )
        .await
    }

    async fn mute(
        &self,
        group: &str,
        user: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), PlatformError> {
        self.bounded("mute", self.inner.mute(group, user, until))
            .await
    }

    async fn unmute(&self, group: &str, user: &str) -> Result<(), PlatformError> {
        self.bounded("unmute", self.inner.unmute(group, user)).await
    }

    fn is_private(&self, event: &Event) -> bool {
        self.inner.is_private(event)
    }

    fn is_membership_join(&self, event: &Event) -> bool {
        self.inner.is_membership_join(event)
    }
}
