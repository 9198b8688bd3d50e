//! Error types shared across the bot.
//!
//! Startup and handler plumbing use `anyhow`; these enums cover the
//! boundaries where callers branch on the kind of failure.

use std::time::Duration;

use crate::platform::Platform;

/// Failures reported by a [`ChatPlatform`](crate::platform::ChatPlatform) call.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("{platform} {operation} timed out after {after:?}")]
    Timeout {
        platform: Platform,
        operation: &'static str,
        after: Duration,
    },

    #[error("{platform} does not support {operation}")]
    Unsupported {
        platform: Platform,
        operation: &'static str,
    },

    #[error("{platform} is not connected")]
    NotConnected { platform: Platform },

    #[error("Invalid target '{0}'")]
    InvalidTarget(String),

    #[error("{platform} API error: {reason}")]
    Api { platform: Platform, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Rejections of a scheduled-send request. These are input errors: they are
/// reported back to the caller, not logged as failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Scheduled time must be in the future")]
    NotInFuture,

    #[error("Invalid scheduled time '{0}', expected RFC 3339")]
    InvalidTime(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("No connected platform named '{0}'")]
    UnknownPlatform(String),
}

/// Configuration problems detected at startup. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_messages() {
        assert_eq!(
            ScheduleError::NotInFuture.to_string(),
            "Scheduled time must be in the future"
        );
        assert_eq!(
            ScheduleError::MissingField("message").to_string(),
            "Missing required field: message"
        );
    }

    #[test]
    fn test_platform_error_names_platform() {
        let err = PlatformError::Unsupported {
            platform: Platform::Twitter,
            operation: "mute",
        };
        assert_eq!(err.to_string(), "twitter does not support mute");
    }
}
