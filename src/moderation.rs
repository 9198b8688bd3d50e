//! Membership moderation: new members are muted on join and unmuted once
//! they privately send the bot the current daily password.
//!
//! Each tracked (platform, group, user) goes through
//! `Pending -> Muted -> Releasing -> (removed)`. `Pending` and `Releasing`
//! mark a remote call in flight so two callers never mute or unmute the same
//! member concurrently. A member is only recorded as muted after the platform
//! confirmed the restriction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, UntrackedUsers};
use crate::password::DailyPassword;
use crate::platform::{ChatPlatform, Event, Platform, Platforms};

pub const VERIFIED_REPLY: &str = "Password correct! Verification successful, you have been unmuted.";
pub const INCORRECT_REPLY: &str = "Incorrect password, please try again.";
pub const UNMUTE_FAILED_REPLY: &str = "Failed to unmute, please contact an administrator.";
pub const IN_PROGRESS_REPLY: &str = "Your verification is already being processed, please wait a moment.";
pub const NO_GROUP_REPLY: &str = "Password correct, but no target group is set. Please contact an administrator.";

fn welcome_reply(name: &str, password: &str) -> String {
    format!(
        "Welcome {} to the group!\n\
         To maintain group order, new members are muted.\n\
         Today's password is: {}\n\
         Please send the password to the bot in private chat to unmute.",
        name, password
    )
}

fn mute_failed_reply(name: &str) -> String {
    format!(
        "Welcome {}! Automatic verification is unavailable right now, please contact an administrator.",
        name
    )
}

fn instructions_reply(prefix: &str) -> String {
    format!(
        "You are not muted in any group I manage.\n\
         Send {}pass here to get today's password.",
        prefix
    )
}

/// Announcement posted to the default group when the bot starts.
pub fn online_announcement(password: &str) -> String {
    format!(
        "🤖 Bot is now online!\n\n\
         Today's password is: {}\n\
         New members will be muted, please send the password to the bot in private chat to unmute.",
        password
    )
}

/// Announcement posted to the default group after a rotation.
pub fn rotation_announcement(password: &str) -> String {
    format!("Today's password for new members is: {}", password)
}

#[derive(Debug, Clone)]
pub struct ModerationSettings {
    pub enabled: bool,
    pub mute_duration: Option<chrono::Duration>,
    pub untracked_users: UntrackedUsers,
    pub default_group: Option<String>,
    pub command_prefix: String,
}

impl ModerationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.moderation.enabled,
            mute_duration: config.moderation.mute_duration(),
            untracked_users: config.moderation.untracked_users,
            default_group: config.default_group().map(str::to_string),
            command_prefix: config.dispatch.command_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MuteKey {
    pub platform: Platform,
    pub group: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuteStatus {
    /// Remote mute requested, not yet confirmed
    Pending,
    Muted,
    /// Remote unmute in flight
    Releasing,
}

#[derive(Debug, Clone, Copy)]
struct MuteEntry {
    status: MuteStatus,
    expiry: Option<DateTime<Utc>>,
}

/// Externally visible state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Unrestricted,
    Muted { expiry: Option<DateTime<Utc>> },
}

/// What the dispatcher should do with a private message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateOutcome {
    /// Moderation handled it; send this reply
    Reply(String),
    /// Not a moderation message; continue with command parsing
    PassThrough,
}

pub struct ModerationStateMachine {
    settings: ModerationSettings,
    members: Mutex<HashMap<MuteKey, MuteEntry>>,
    password: RwLock<DailyPassword>,
}

impl ModerationStateMachine {
    pub fn new(settings: ModerationSettings, password: DailyPassword) -> Self {
        Self {
            settings,
            members: Mutex::new(HashMap::new()),
            password: RwLock::new(password),
        }
    }

    pub fn settings(&self) -> &ModerationSettings {
        &self.settings
    }

    pub async fn current_password(&self) -> DailyPassword {
        self.password.read().await.clone()
    }

    /// Replace the daily password. The previous one stops working at once.
    pub async fn rotate_password(&self, password: DailyPassword) {
        let mut current = self.password.write().await;
        info!(
            "Daily password rotated (generated {})",
            password.generated_on
        );
        *current = password;
    }

    #[allow(dead_code)]
    pub async fn state(&self, platform: Platform, group: &str, user: &str) -> MemberState {
        let key = MuteKey {
            platform,
            group: group.to_string(),
            user: user.to_string(),
        };
        match self.members.lock().await.get(&key) {
            Some(entry) if entry.status != MuteStatus::Pending => MemberState::Muted {
                expiry: entry.expiry,
            },
            _ => MemberState::Unrestricted,
        }
    }

    /// Number of members currently tracked as muted.
    pub async fn muted_count(&self) -> usize {
        self.members
            .lock()
            .await
            .values()
            .filter(|e| e.status != MuteStatus::Pending)
            .count()
    }

    /// A member joined a group: mute them and return the welcome reply.
    pub async fn on_join(&self, event: &Event, platform: &dyn ChatPlatform) -> Option<String> {
        if !self.settings.enabled {
            debug!(
                "Moderation disabled, ignoring join of {} in {}",
                event.sender_id, event.chat_id
            );
            return None;
        }

        let key = MuteKey {
            platform: event.platform,
            group: event.chat_id.clone(),
            user: event.sender_id.clone(),
        };
        let expiry = self
            .settings
            .mute_duration
            .and_then(|d| Utc::now().checked_add_signed(d));

        {
            let mut members = self.members.lock().await;
            match members.get(&key).map(|e| e.status) {
                Some(MuteStatus::Muted) => {
                    info!(
                        "{} rejoined {} while still muted",
                        event.sender_id, event.chat_id
                    );
                    drop(members);
                    let password = self.current_password().await;
                    return Some(welcome_reply(&event.sender_name, &password.value));
                }
                Some(_) => {
                    debug!("Mute for {} already in flight", event.sender_id);
                    return None;
                }
                None => {
                    members.insert(
                        key.clone(),
                        MuteEntry {
                            status: MuteStatus::Pending,
                            expiry,
                        },
                    );
                }
            }
        }

        let result = platform.mute(&key.group, &key.user, expiry).await;

        let mut members = self.members.lock().await;
        match result {
            Ok(()) => {
                members.insert(
                    key.clone(),
                    MuteEntry {
                        status: MuteStatus::Muted,
                        expiry,
                    },
                );
                drop(members);
                info!(
                    "Muted new member {} ({}) in {} until {}",
                    event.sender_name,
                    key.user,
                    key.group,
                    expiry.map_or_else(|| "verified".to_string(), |e| e.to_rfc3339())
                );
                let password = self.current_password().await;
                Some(welcome_reply(&event.sender_name, &password.value))
            }
            Err(e) => {
                members.remove(&key);
                error!(
                    "Failed to mute new member {} in {}: {}",
                    key.user, key.group, e
                );
                Some(mute_failed_reply(&event.sender_name))
            }
        }
    }

    /// A private message arrived: verify it against the daily password.
    pub async fn on_private_message(
        &self,
        event: &Event,
        platform: &dyn ChatPlatform,
    ) -> PrivateOutcome {
        if !self.settings.enabled {
            return PrivateOutcome::PassThrough;
        }

        let password = self.current_password().await;
        let matches = password.matches(&event.text);
        if !matches && event.text.starts_with(&self.settings.command_prefix) {
            return PrivateOutcome::PassThrough;
        }

        // Claim every confirmed mute for this user while holding the lock
        let (claimed, busy) = {
            let mut members = self.members.lock().await;
            let mut claimed = Vec::new();
            let mut busy = false;
            for (key, entry) in members.iter_mut() {
                if key.platform != event.platform || key.user != event.sender_id {
                    continue;
                }
                match entry.status {
                    MuteStatus::Muted if matches => {
                        entry.status = MuteStatus::Releasing;
                        claimed.push(key.clone());
                    }
                    MuteStatus::Muted => claimed.push(key.clone()),
                    MuteStatus::Pending | MuteStatus::Releasing => busy = true,
                }
            }
            (claimed, busy)
        };

        if claimed.is_empty() && !busy {
            return self.untracked(event, platform, matches).await;
        }
        if !matches {
            info!("Wrong password from muted user {}", event.sender_id);
            return PrivateOutcome::Reply(INCORRECT_REPLY.to_string());
        }
        if claimed.is_empty() {
            return PrivateOutcome::Reply(IN_PROGRESS_REPLY.to_string());
        }

        let mut all_released = true;
        for key in claimed {
            if !self.release(&key, platform).await {
                all_released = false;
            }
        }

        if all_released {
            PrivateOutcome::Reply(VERIFIED_REPLY.to_string())
        } else {
            PrivateOutcome::Reply(UNMUTE_FAILED_REPLY.to_string())
        }
    }

    async fn untracked(
        &self,
        event: &Event,
        platform: &dyn ChatPlatform,
        matches: bool,
    ) -> PrivateOutcome {
        match self.settings.untracked_users {
            UntrackedUsers::Instructions => PrivateOutcome::Reply(instructions_reply(
                &self.settings.command_prefix,
            )),
            UntrackedUsers::Verify if !matches => {
                PrivateOutcome::Reply(INCORRECT_REPLY.to_string())
            }
            UntrackedUsers::Verify => {
                let Some(group) = self.settings.default_group.as_deref() else {
                    warn!("Correct password from {} but no default group", event.sender_id);
                    return PrivateOutcome::Reply(NO_GROUP_REPLY.to_string());
                };
                match platform.unmute(group, &event.sender_id).await {
                    Ok(()) => {
                        info!("Unmuted untracked user {} in {}", event.sender_id, group);
                        PrivateOutcome::Reply(VERIFIED_REPLY.to_string())
                    }
                    Err(e) => {
                        error!("Failed to unmute {} in {}: {}", event.sender_id, group, e);
                        PrivateOutcome::Reply(UNMUTE_FAILED_REPLY.to_string())
                    }
                }
            }
        }
    }

    /// Unmute a claimed (`Releasing`) member. Removes the entry on success and
    /// restores `Muted` on failure so a later attempt can retry.
    async fn release(&self, key: &MuteKey, platform: &dyn ChatPlatform) -> bool {
        let result = platform.unmute(&key.group, &key.user).await;
        let mut members = self.members.lock().await;
        match result {
            Ok(()) => {
                members.remove(key);
                info!("Unmuted {} in {}", key.user, key.group);
                true
            }
            Err(e) => {
                if let Some(entry) = members.get_mut(key) {
                    entry.status = MuteStatus::Muted;
                }
                error!("Failed to unmute {} in {}: {}", key.user, key.group, e);
                false
            }
        }
    }

    /// Unmute every member whose mute expired at or before `now`.
    /// Returns how many were released.
    pub async fn sweep_expired(&self, now: DateTime<Utc>, platforms: &Platforms) -> usize {
        let expired: Vec<MuteKey> = {
            let mut members = self.members.lock().await;
            members
                .iter_mut()
                .filter(|(_, e)| {
                    e.status == MuteStatus::Muted && e.expiry.is_some_and(|at| at <= now)
                })
                .map(|(key, entry)| {
                    entry.status = MuteStatus::Releasing;
                    key.clone()
                })
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }
        debug!("Sweeping {} expired mute(s)", expired.len());

        let mut released = 0;
        for key in expired {
            match platforms.get(&key.platform) {
                Some(platform) => {
                    if self.release(&key, platform.as_ref()).await {
                        released += 1;
                    }
                }
                None => {
                    warn!("No {} platform to unmute {}", key.platform, key.user);
                    if let Some(entry) = self.members.lock().await.get_mut(&key) {
                        entry.status = MuteStatus::Muted;
                    }
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::platform::mock::{Call, MockPlatform};

    const GROUP: &str = "-100G";

    fn settings() -> ModerationSettings {
        ModerationSettings {
            enabled: true,
            mute_duration: Some(chrono::Duration::hours(4)),
            untracked_users: UntrackedUsers::Instructions,
            default_group: Some(GROUP.to_string()),
            command_prefix: "/".to_string(),
        }
    }

    fn machine(settings: ModerationSettings) -> ModerationStateMachine {
        ModerationStateMachine::new(settings, DailyPassword::new("S3cretPw"))
    }

    fn join(user: &str) -> Event {
        Event {
            platform: Platform::Telegram,
            chat_id: GROUP.to_string(),
            message_id: Some("1".to_string()),
            sender_id: user.to_string(),
            sender_name: user.to_string(),
            text: String::new(),
            is_private: false,
            is_membership_join: true,
            mentions_bot: false,
        }
    }

    fn private(user: &str, text: &str) -> Event {
        Event {
            platform: Platform::Telegram,
            chat_id: user.to_string(),
            message_id: Some("2".to_string()),
            sender_id: user.to_string(),
            sender_name: user.to_string(),
            text: text.to_string(),
            is_private: true,
            is_membership_join: false,
            mentions_bot: false,
        }
    }

    #[tokio::test]
    async fn test_join_mutes_once_with_expiry_and_welcomes() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);

        let before = Utc::now();
        let reply = moderation.on_join(&join("alice"), &platform).await.unwrap();
        let after = Utc::now();

        assert!(reply.contains("Welcome alice"));
        assert!(reply.contains("S3cretPw"));

        let mutes = platform.mutes();
        assert_eq!(mutes.len(), 1);
        match &mutes[0] {
            Call::Mute { group, user, until } => {
                assert_eq!(group, GROUP);
                assert_eq!(user, "alice");
                let until = until.unwrap();
                assert!(until >= before + chrono::Duration::hours(4));
                assert!(until <= after + chrono::Duration::hours(4));
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert!(matches!(
            moderation.state(Platform::Telegram, GROUP, "alice").await,
            MemberState::Muted { expiry: Some(_) }
        ));
    }

    #[tokio::test]
    async fn test_join_without_duration_mutes_indefinitely() {
        let moderation = machine(ModerationSettings {
            mute_duration: None,
            ..settings()
        });
        let platform = MockPlatform::new(Platform::Telegram);

        moderation.on_join(&join("bob"), &platform).await;

        assert_eq!(
            platform.mutes(),
            vec![Call::Mute {
                group: GROUP.to_string(),
                user: "bob".to_string(),
                until: None
            }]
        );
        assert_eq!(
            moderation.state(Platform::Telegram, GROUP, "bob").await,
            MemberState::Muted { expiry: None }
        );
    }

    #[tokio::test]
    async fn test_failed_mute_is_not_recorded() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);
        platform.fail_mute.store(true, Ordering::SeqCst);

        let reply = moderation.on_join(&join("alice"), &platform).await.unwrap();

        assert!(reply.contains("contact an administrator"));
        assert!(!reply.contains("S3cretPw"));
        assert_eq!(
            moderation.state(Platform::Telegram, GROUP, "alice").await,
            MemberState::Unrestricted
        );
        assert_eq!(moderation.muted_count().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_moderation_ignores_join() {
        let moderation = machine(ModerationSettings {
            enabled: false,
            ..settings()
        });
        let platform = MockPlatform::new(Platform::Telegram);

        assert!(moderation.on_join(&join("alice"), &platform).await.is_none());
        assert!(platform.calls().is_empty());
        assert_eq!(
            moderation
                .on_private_message(&private("alice", "S3cretPw"), &platform)
                .await,
            PrivateOutcome::PassThrough
        );
    }

    #[tokio::test]
    async fn test_correct_password_unmutes_once() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);
        moderation.on_join(&join("alice"), &platform).await;

        let outcome = moderation
            .on_private_message(&private("alice", "S3cretPw"), &platform)
            .await;

        assert_eq!(outcome, PrivateOutcome::Reply(VERIFIED_REPLY.to_string()));
        assert!(VERIFIED_REPLY.to_lowercase().contains("verification successful"));
        assert_eq!(
            platform.unmutes(),
            vec![Call::Unmute {
                group: GROUP.to_string(),
                user: "alice".to_string()
            }]
        );
        assert_eq!(
            moderation.state(Platform::Telegram, GROUP, "alice").await,
            MemberState::Unrestricted
        );
    }

    #[tokio::test]
    async fn test_wrong_password_keeps_mute_without_platform_calls() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);
        moderation.on_join(&join("alice"), &platform).await;
        let calls_after_join = platform.calls().len();

        for attempt in ["s3cretpw", "S3cretPw ", "hello"] {
            let outcome = moderation
                .on_private_message(&private("alice", attempt), &platform)
                .await;
            assert_eq!(outcome, PrivateOutcome::Reply(INCORRECT_REPLY.to_string()));
        }

        assert_eq!(platform.calls().len(), calls_after_join);
        assert!(matches!(
            moderation.state(Platform::Telegram, GROUP, "alice").await,
            MemberState::Muted { .. }
        ));
    }

    #[tokio::test]
    async fn test_command_text_passes_through() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);
        moderation.on_join(&join("alice"), &platform).await;

        let outcome = moderation
            .on_private_message(&private("alice", "/pass"), &platform)
            .await;
        assert_eq!(outcome, PrivateOutcome::PassThrough);
    }

    #[tokio::test]
    async fn test_failed_unmute_stays_muted_and_can_retry() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);
        moderation.on_join(&join("alice"), &platform).await;
        platform.fail_unmute.store(true, Ordering::SeqCst);

        let outcome = moderation
            .on_private_message(&private("alice", "S3cretPw"), &platform)
            .await;
        assert_eq!(outcome, PrivateOutcome::Reply(UNMUTE_FAILED_REPLY.to_string()));
        assert!(matches!(
            moderation.state(Platform::Telegram, GROUP, "alice").await,
            MemberState::Muted { .. }
        ));

        platform.fail_unmute.store(false, Ordering::SeqCst);
        let outcome = moderation
            .on_private_message(&private("alice", "S3cretPw"), &platform)
            .await;
        assert_eq!(outcome, PrivateOutcome::Reply(VERIFIED_REPLY.to_string()));
        assert_eq!(platform.unmutes().len(), 2);
    }

    #[tokio::test]
    async fn test_untracked_user_gets_instructions() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);

        let outcome = moderation
            .on_private_message(&private("carol", "S3cretPw"), &platform)
            .await;

        match outcome {
            PrivateOutcome::Reply(text) => assert!(text.contains("/pass")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_user_verified_against_default_group() {
        let moderation = machine(ModerationSettings {
            untracked_users: UntrackedUsers::Verify,
            ..settings()
        });
        let platform = MockPlatform::new(Platform::Telegram);

        let wrong = moderation
            .on_private_message(&private("carol", "nope"), &platform)
            .await;
        assert_eq!(wrong, PrivateOutcome::Reply(INCORRECT_REPLY.to_string()));
        assert!(platform.calls().is_empty());

        let right = moderation
            .on_private_message(&private("carol", "S3cretPw"), &platform)
            .await;
        assert_eq!(right, PrivateOutcome::Reply(VERIFIED_REPLY.to_string()));
        assert_eq!(
            platform.unmutes(),
            vec![Call::Unmute {
                group: GROUP.to_string(),
                user: "carol".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_rotation_invalidates_old_password() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);
        moderation.on_join(&join("alice"), &platform).await;

        moderation.rotate_password(DailyPassword::new("NewPass1")).await;
        moderation.rotate_password(DailyPassword::new("NewPass1")).await;

        let old = moderation
            .on_private_message(&private("alice", "S3cretPw"), &platform)
            .await;
        assert_eq!(old, PrivateOutcome::Reply(INCORRECT_REPLY.to_string()));

        let new = moderation
            .on_private_message(&private("alice", "NewPass1"), &platform)
            .await;
        assert_eq!(new, PrivateOutcome::Reply(VERIFIED_REPLY.to_string()));
        assert_eq!(moderation.current_password().await.value, "NewPass1");
    }

    #[tokio::test]
    async fn test_unrepresentable_expiry_mutes_without_deadline() {
        let moderation = machine(ModerationSettings {
            mute_duration: Some(chrono::TimeDelta::MAX),
            ..settings()
        });
        let mock = MockPlatform::new(Platform::Telegram);

        moderation.on_join(&join("alice"), &mock).await;

        assert_eq!(
            mock.mutes(),
            vec![Call::Mute {
                group: GROUP.to_string(),
                user: "alice".to_string(),
                until: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_sweep_releases_only_expired() {
        let moderation = machine(ModerationSettings {
            mute_duration: Some(chrono::Duration::minutes(10)),
            ..settings()
        });
        let mock = Arc::new(MockPlatform::new(Platform::Telegram));
        moderation.on_join(&join("alice"), mock.as_ref()).await;

        let indefinite = machine(ModerationSettings {
            mute_duration: None,
            ..settings()
        });
        indefinite.on_join(&join("bob"), mock.as_ref()).await;

        let mut platforms = Platforms::new();
        platforms.insert(Platform::Telegram, mock.clone() as Arc<dyn ChatPlatform>);

        let now = Utc::now();
        assert_eq!(moderation.sweep_expired(now, &platforms).await, 0);
        assert!(mock.unmutes().is_empty());

        let later = now + chrono::Duration::minutes(11);
        assert_eq!(moderation.sweep_expired(later, &platforms).await, 1);
        assert_eq!(indefinite.sweep_expired(later, &platforms).await, 0);
        assert_eq!(
            mock.unmutes(),
            vec![Call::Unmute {
                group: GROUP.to_string(),
                user: "alice".to_string()
            }]
        );
        assert_eq!(
            moderation.state(Platform::Telegram, GROUP, "alice").await,
            MemberState::Unrestricted
        );
        assert_eq!(moderation.sweep_expired(later, &platforms).await, 0);
    }

    #[tokio::test]
    async fn test_sweep_failure_retries_next_time() {
        let moderation = machine(ModerationSettings {
            mute_duration: Some(chrono::Duration::minutes(1)),
            ..settings()
        });
        let mock = Arc::new(MockPlatform::new(Platform::Telegram));
        moderation.on_join(&join("alice"), mock.as_ref()).await;
        let mut platforms = Platforms::new();
        platforms.insert(Platform::Telegram, mock.clone() as Arc<dyn ChatPlatform>);

        let later = Utc::now() + chrono::Duration::minutes(2);
        mock.fail_unmute.store(true, Ordering::SeqCst);
        assert_eq!(moderation.sweep_expired(later, &platforms).await, 0);
        assert_eq!(moderation.muted_count().await, 1);

        mock.fail_unmute.store(false, Ordering::SeqCst);
        assert_eq!(moderation.sweep_expired(later, &platforms).await, 1);
        assert_eq!(moderation.muted_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_while_muted_does_not_mute_again() {
        let moderation = machine(settings());
        let platform = MockPlatform::new(Platform::Telegram);
        moderation.on_join(&join("alice"), &platform).await;
        let reply = moderation.on_join(&join("alice"), &platform).await.unwrap();

        assert!(reply.contains("S3cretPw"));
        assert_eq!(platform.mutes().len(), 1);
    }
}
