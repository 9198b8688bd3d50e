use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ScheduleError};
use crate::platform::Platform;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub twitter: Option<TwitterConfig>,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub scheduled_messages: Vec<ScheduledMessageConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Group that receives announcements and whose members get unmuted in
    /// `verify` mode. Numeric chat id or `@username`.
    #[serde(default)]
    pub default_group: Option<String>,
    /// Used for mention detection; learned from the API when unset
    #[serde(default)]
    pub bot_username: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwitterConfig {
    pub bearer_token: String,
    #[serde(default = "default_twitter_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// How to treat a private message from a user who is not tracked as muted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UntrackedUsers {
    /// Reply with instructions for getting the password
    #[default]
    Instructions,
    /// Check the password anyway and unmute in the default group
    Verify,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModerationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Absent means new members stay muted until they verify
    #[serde(default)]
    pub mute_duration_secs: Option<u64>,
    #[serde(default)]
    pub untracked_users: UntrackedUsers,
    /// Only hand out the password via `/pass` in private chat
    #[serde(default = "default_true")]
    pub pass_private_only: bool,
    #[serde(default = "default_password_length")]
    pub password_length: usize,
    #[serde(default = "default_true")]
    pub announce_online: bool,
    #[serde(default = "default_true")]
    pub announce_rotation: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Cron expression (with seconds) for the mute-expiry sweep
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,
    #[serde(default = "default_rotation_retry_secs")]
    pub rotation_retry_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_platform_timeout_secs")]
    pub platform_timeout_secs: u64,
    /// Development only: reply with raw error text instead of the apology
    #[serde(default)]
    pub echo_errors: bool,
}

/// A message to deliver later, declared in the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduledMessageConfig {
    pub platform: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub message: String,
    pub fire_at: String,
}

impl ScheduledMessageConfig {
    /// Validate the raw fields into typed values. Does not check the time
    /// against the clock; the scheduler does that when arming.
    pub fn parse(&self) -> std::result::Result<(Platform, DateTime<Utc>), ScheduleError> {
        if self.message.trim().is_empty() {
            return Err(ScheduleError::MissingField("message"));
        }
        if self.target.trim().is_empty() {
            return Err(ScheduleError::MissingField("target"));
        }
        let platform = self
            .platform
            .parse::<Platform>()
            .map_err(ScheduleError::UnknownPlatform)?;
        let fire_at = parse_fire_at(&self.fire_at)?;
        Ok((platform, fire_at))
    }
}

/// Parse an RFC 3339 timestamp such as `2026-01-01T09:00:00Z`.
pub fn parse_fire_at(raw: &str) -> std::result::Result<DateTime<Utc>, ScheduleError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
}

fn default_true() -> bool {
    true
}

fn default_twitter_api_base() -> String {
    "https://api.twitter.com/2".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_password_length() -> usize {
    8
}

fn default_sweep_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_rotation_retry_secs() -> u64 {
    60
}

fn default_command_prefix() -> String {
    "/".to_string()
}

fn default_dedup_window_secs() -> u64 {
    86_400
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_platform_timeout_secs() -> u64 {
    20
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mute_duration_secs: None,
            untracked_users: UntrackedUsers::default(),
            pass_private_only: true,
            password_length: default_password_length(),
            announce_online: true,
            announce_rotation: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_cron: default_sweep_cron(),
            rotation_retry_secs: default_rotation_retry_secs(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            dedup_window_secs: default_dedup_window_secs(),
            dedup_capacity: default_dedup_capacity(),
            platform_timeout_secs: default_platform_timeout_secs(),
            echo_errors: false,
        }
    }
}

/// Telegram treats restrictions longer than 366 days as permanent.
pub const MAX_MUTE_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

impl ModerationConfig {
    /// Configured mute length; `None` also for values outside the
    /// representable range, which `validate` rejects up front.
    pub fn mute_duration(&self) -> Option<chrono::TimeDelta> {
        self.mute_duration_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::TimeDelta::try_seconds)
    }
}

impl DispatchConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn platform_timeout(&self) -> Duration {
        Duration::from_secs(self.platform_timeout_secs)
    }
}

impl SchedulerConfig {
    pub fn rotation_retry(&self) -> Duration {
        Duration::from_secs(self.rotation_retry_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Default group, if one is configured.
    pub fn default_group(&self) -> Option<&str> {
        self.telegram
            .default_group
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "telegram.bot_token".to_string(),
                hint: "Create a bot with @BotFather and paste its token.".to_string(),
            });
        }
        if self.moderation.enabled && self.default_group().is_none() {
            return Err(ConfigError::MissingRequired {
                key: "telegram.default_group".to_string(),
                hint: "Moderation needs the group new members are unmuted in.".to_string(),
            });
        }
        if let Some(twitter) = &self.twitter {
            if twitter.bearer_token.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: "twitter.bearer_token".to_string(),
                    hint: "Remove the [twitter] section to run without Twitter.".to_string(),
                });
            }
            if twitter.poll_interval_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "twitter.poll_interval_secs".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if let Some(secs) = self.moderation.mute_duration_secs {
            if secs == 0 || secs > MAX_MUTE_DURATION_SECS {
                return Err(ConfigError::InvalidValue {
                    key: "moderation.mute_duration_secs".to_string(),
                    message: format!(
                        "must be between 1 and {} (omit it to mute until verified)",
                        MAX_MUTE_DURATION_SECS
                    ),
                });
            }
        }
        if self.moderation.password_length < 4 {
            return Err(ConfigError::InvalidValue {
                key: "moderation.password_length".to_string(),
                message: "must be at least 4".to_string(),
            });
        }
        if self.dispatch.command_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "dispatch.command_prefix".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.dispatch.dedup_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dispatch.dedup_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.dispatch.platform_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dispatch.platform_timeout_secs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
