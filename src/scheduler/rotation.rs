use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::moderation::{rotation_announcement, ModerationStateMachine};
use crate::password::PasswordGenerator;
use crate::platform::ChatPlatform;

/// Start of the next calendar day in `now`'s time zone.
///
/// If local midnight does not exist that day (DST gap) the first valid
/// instant after it is used; if it is ambiguous the earlier one wins.
pub fn next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let midnight = (now.date_naive() + Days::new(1)).and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(midnight + chrono::Duration::hours(1)))
                .earliest()
        })
        .unwrap_or_else(|| now.clone() + chrono::Duration::hours(24))
}

/// Source of the current time and of rotation boundaries.
pub trait RotationClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// First boundary strictly after `after`.
    fn next_rotation(&self, after: DateTime<Utc>) -> DateTime<Utc>;
}

/// Wall clock, rotating at local midnight.
pub struct LocalMidnight;

impl RotationClock for LocalMidnight {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn next_rotation(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        next_midnight(&after.with_timezone(&Local)).with_timezone(&Utc)
    }
}

/// Where rotated passwords are announced.
pub struct Announcement {
    pub platform: Arc<dyn ChatPlatform>,
    pub group: String,
}

/// Replaces the daily password at every local midnight for the lifetime of
/// the process.
pub struct PasswordRotation {
    moderation: Arc<ModerationStateMachine>,
    generator: PasswordGenerator,
    announce: Option<Announcement>,
    retry: Duration,
    clock: Arc<dyn RotationClock>,
}

impl PasswordRotation {
    pub fn new(
        moderation: Arc<ModerationStateMachine>,
        generator: PasswordGenerator,
        announce: Option<Announcement>,
        retry: Duration,
    ) -> Self {
        Self {
            moderation,
            generator,
            announce,
            retry,
            clock: Arc::new(LocalMidnight),
        }
    }

    /// Use `clock` instead of the wall clock and local midnight.
    #[allow(dead_code)]
    pub fn with_clock(mut self, clock: Arc<dyn RotationClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Generate, install and announce a new password.
    ///
    /// The new password is live before the announcement is attempted, so an
    /// announcement failure never leaves the old one in place.
    pub async fn rotate_once(&self) -> Result<()> {
        let password = self.generator.generate();
        self.moderation.rotate_password(password.clone()).await;

        if let Some(announce) = &self.announce {
            announce
                .platform
                .send_text(&announce.group, &rotation_announcement(&password.value), None)
                .await
                .with_context(|| format!("Failed to announce new password to {}", announce.group))?;
            debug!("Announced new password to {}", announce.group);
        }
        Ok(())
    }

    /// Rotate at each boundary until `shutdown` fires. A failed rotation is
    /// logged and followed by a short backoff; the loop itself never exits
    /// on error.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Password rotation loop started");
        loop {
            let next = self.clock.next_rotation(self.clock.now());
            info!("Next password rotation at {}", next.with_timezone(&Local));

            // Sleep in a loop so a wall-clock adjustment cannot rotate early
            loop {
                let remaining = match (next - self.clock.now()).to_std() {
                    Ok(d) if !d.is_zero() => d,
                    _ => break,
                };
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = shutdown.changed() => {
                        info!("Password rotation loop stopped");
                        return;
                    }
                }
            }

            match self.rotate_once().await {
                Ok(()) => info!("Daily password rotated"),
                Err(e) => {
                    error!("Password rotation failed: {:#}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry) => {}
                        _ = shutdown.changed() => {
                            info!("Password rotation loop stopped");
                            return;
                        }
                    }
                }
            }
        }
    }
}
