use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::commands::builtin::register_builtin_commands;
use crate::commands::CommandRegistry;
use crate::config::{Config, ScheduledMessageConfig};
use crate::dispatch::dedup::DedupFilter;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::error::ScheduleError;
use crate::moderation::{online_announcement, ModerationSettings, ModerationStateMachine};
use crate::password::PasswordGenerator;
use crate::platform::guard::GuardedPlatform;
use crate::platform::telegram::{self, TelegramPlatform};
use crate::platform::twitter::{self, TwitterPlatform};
use crate::platform::{ChatPlatform, Platform, Platforms};
use crate::scheduler::delayed::{DelayedSender, Payload, ScheduledSend};
use crate::scheduler::rotation::{Announcement, PasswordRotation};
use crate::scheduler::tasks::register_builtin_tasks;
use crate::scheduler::Scheduler;

/// Top-level service: owns the shared state and every background task.
pub struct BotService {
    config: Config,
    telegram: Arc<TelegramPlatform>,
    twitter: Option<Arc<TwitterPlatform>>,
    /// Guarded handles; everything in the core talks to platforms via these
    platforms: Arc<Platforms>,
    moderation: Arc<ModerationStateMachine>,
    router: Arc<Dispatcher>,
    generator: PasswordGenerator,
    delayed: DelayedSender,
}

impl BotService {
    pub fn new(config: Config) -> Self {
        let timeout = config.dispatch.platform_timeout();
        let telegram = Arc::new(TelegramPlatform::new(
            &config.telegram.bot_token,
            config.telegram.bot_username.clone(),
        ));
        let twitter = config
            .twitter
            .clone()
            .map(|c| Arc::new(TwitterPlatform::new(c)));

        let mut platforms = Platforms::new();
        platforms.insert(
            Platform::Telegram,
            Arc::new(GuardedPlatform::new(telegram.clone(), timeout)),
        );
        if let Some(twitter) = &twitter {
            platforms.insert(
                Platform::Twitter,
                Arc::new(GuardedPlatform::new(twitter.clone(), timeout)),
            );
        }

        let generator = PasswordGenerator::new(config.moderation.password_length);
        let moderation = Arc::new(ModerationStateMachine::new(
            ModerationSettings::from_config(&config),
            generator.generate(),
        ));

        let mut registry = CommandRegistry::new();
        register_builtin_commands(&mut registry, config.moderation.pass_private_only);

        let router = Arc::new(Dispatcher::new(
            registry,
            DedupFilter::new(
                config.dispatch.dedup_window(),
                config.dispatch.dedup_capacity,
            ),
            moderation.clone(),
            DispatchSettings {
                command_prefix: config.dispatch.command_prefix.clone(),
                echo_errors: config.dispatch.echo_errors,
            },
        ));

        Self {
            config,
            telegram,
            twitter,
            platforms: Arc::new(platforms),
            moderation,
            router,
            generator,
            delayed: DelayedSender::new(),
        }
    }

    fn platform(&self, platform: Platform) -> Option<Arc<dyn ChatPlatform>> {
        self.platforms.get(&platform).cloned()
    }

    /// Accept a scheduled-send request. Input problems come back as a
    /// rejection; nothing is armed in that case.
    pub async fn schedule_message(
        &self,
        request: &ScheduledMessageConfig,
    ) -> std::result::Result<ScheduledSend, ScheduleError> {
        let (platform, fire_at) = request.parse()?;
        let handle = self
            .platform(platform)
            .ok_or_else(|| ScheduleError::UnknownPlatform(platform.to_string()))?;
        self.delayed
            .schedule_send(handle, &request.target, Payload::text(&request.message), fire_at)
            .await
    }

    async fn connect_all(&self) -> Result<()> {
        let results = join_all(self.platforms.values().map(|p| async move {
            (p.platform(), p.connect().await)
        }))
        .await;
        for (platform, connected) in results {
            if !connected {
                bail!("Failed to connect to {}", platform);
            }
        }
        Ok(())
    }

    async fn announce_online(&self) {
        let moderation = &self.config.moderation;
        if !moderation.enabled || !moderation.announce_online {
            return;
        }
        let (Some(group), Some(platform)) =
            (self.config.default_group(), self.platform(Platform::Telegram))
        else {
            return;
        };
        let password = self.moderation.current_password().await;
        match platform
            .send_text(group, &online_announcement(&password.value), None)
            .await
        {
            Ok(_) => info!("Posted online announcement to {}", group),
            Err(e) => warn!("Failed to post online announcement to {}: {}", group, e),
        }
    }

    fn rotation(&self) -> PasswordRotation {
        let moderation = &self.config.moderation;
        let announce = match (
            moderation.enabled && moderation.announce_rotation,
            self.config.default_group(),
            self.platform(Platform::Telegram),
        ) {
            (true, Some(group), Some(platform)) => Some(Announcement {
                platform,
                group: group.to_string(),
            }),
            _ => None,
        };
        PasswordRotation::new(
            self.moderation.clone(),
            self.generator.clone(),
            announce,
            self.config.scheduler.rotation_retry(),
        )
    }

    /// Connect, start every task, and run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.connect_all().await?;

        let mut scheduler = Scheduler::new().await?;
        register_builtin_tasks(
            &scheduler,
            self.moderation.clone(),
            self.platforms.clone(),
            &self.config.scheduler.sweep_cron,
        )
        .await?;
        scheduler.start().await?;

        for request in &self.config.scheduled_messages {
            match self.schedule_message(request).await {
                Ok(scheduled) => info!(
                    "Accepted scheduled message {} for {}",
                    scheduled.id, scheduled.fire_at
                ),
                Err(e) => info!(
                    "Rejected scheduled message for {} on {}: {}",
                    request.target, request.platform, e
                ),
            }
        }

        self.announce_online().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(self.rotation().run(shutdown_rx.clone())));

        let telegram_listener = {
            let platform = self
                .platform(Platform::Telegram)
                .context("Telegram platform missing")?;
            tokio::spawn(telegram::listen(
                self.telegram.bot(),
                self.telegram.username().await,
                self.router.clone(),
                platform,
            ))
        };

        if let (Some(twitter), Some(platform)) = (&self.twitter, self.platform(Platform::Twitter)) {
            tasks.push(tokio::spawn(twitter::listen(
                twitter.clone(),
                self.router.clone(),
                platform,
                shutdown_rx.clone(),
            )));
        }

        info!("Bot is running, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutting down...");

        // Receivers may already be gone if a task exited; nothing to signal then
        let _ = shutdown_tx.send(true);
        telegram_listener.abort();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }

        self.delayed.shutdown().await;
        if let Err(e) = scheduler.shutdown().await {
            warn!("{:#}", e);
        }
        join_all(self.platforms.values().map(|p| p.disconnect())).await;

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [telegram]
        bot_token = "123:abc"
        default_group = "-100123"
    "#;

    fn request(platform: &str, fire_at: String) -> ScheduledMessageConfig {
        ScheduledMessageConfig {
            platform: platform.to_string(),
            target: "-100123".to_string(),
            message: "hello".to_string(),
            fire_at,
        }
    }

    #[tokio::test]
    async fn test_schedule_message_accepts_future_time() {
        let service = BotService::new(Config::parse(CONFIG).unwrap());
        let fire_at = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();

        let scheduled = service
            .schedule_message(&request("telegram", fire_at))
            .await
            .unwrap();

        assert_eq!(scheduled.platform, Platform::Telegram);
        assert_eq!(service.delayed.pending().await, 1);
        service.delayed.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_message_rejections() {
        let service = BotService::new(Config::parse(CONFIG).unwrap());

        let past = service
            .schedule_message(&request("telegram", "2020-01-01T00:00:00Z".to_string()))
            .await;
        assert_eq!(past.unwrap_err(), ScheduleError::NotInFuture);

        let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let unconfigured = service
            .schedule_message(&request("twitter", future))
            .await;
        assert_eq!(
            unconfigured.unwrap_err(),
            ScheduleError::UnknownPlatform("twitter".to_string())
        );

        let garbage = service
            .schedule_message(&request("telegram", "tomorrow".to_string()))
            .await;
        assert!(matches!(garbage, Err(ScheduleError::InvalidTime(_))));

        assert_eq!(service.delayed.pending().await, 0);
    }

    #[test]
    fn test_new_wires_configured_platforms() {
        let service = BotService::new(Config::parse(CONFIG).unwrap());
        assert!(service.platform(Platform::Telegram).is_some());
        assert!(service.platform(Platform::Twitter).is_none());
        assert_eq!(
            service.moderation.settings().default_group.as_deref(),
            Some("-100123")
        );
    }
}
