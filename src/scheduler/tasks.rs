use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::moderation::ModerationStateMachine;
use crate::platform::Platforms;
use crate::scheduler::Scheduler;

/// Register built-in recurring jobs
pub async fn register_builtin_tasks(
    scheduler: &Scheduler,
    moderation: Arc<ModerationStateMachine>,
    platforms: Arc<Platforms>,
    sweep_cron: &str,
) -> anyhow::Result<()> {
    // Mute expiry: release members whose mute duration has elapsed
    scheduler
        .add_cron_job(sweep_cron, "mute-expiry-sweep", move || {
            let moderation = moderation.clone();
            let platforms = platforms.clone();
            Box::pin(async move {
                let released = moderation.sweep_expired(Utc::now(), &platforms).await;
                if released > 0 {
                    let remaining = moderation.muted_count().await;
                    info!(
                        "Mute sweep released {} member(s), {} still muted",
                        released, remaining
                    );
                }
            })
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::UntrackedUsers;
    use crate::moderation::ModerationSettings;
    use crate::password::DailyPassword;

    fn moderation() -> Arc<ModerationStateMachine> {
        Arc::new(ModerationStateMachine::new(
            ModerationSettings {
                enabled: true,
                mute_duration: None,
                untracked_users: UntrackedUsers::Instructions,
                default_group: None,
                command_prefix: "/".to_string(),
            },
            DailyPassword::new("pw"),
        ))
    }

    #[tokio::test]
    async fn test_register_sweep_job() {
        let scheduler = Scheduler::new().await.unwrap();
        register_builtin_tasks(
            &scheduler,
            moderation(),
            Arc::new(Platforms::new()),
            "0 * * * * *",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let scheduler = Scheduler::new().await.unwrap();
        let result = register_builtin_tasks(
            &scheduler,
            moderation(),
            Arc::new(Platforms::new()),
            "every minute",
        )
        .await;
        assert!(result.is_err());
    }
}
