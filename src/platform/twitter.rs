use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::{Attachment, ChatPlatform, Entity, Event, Platform};
use crate::config::TwitterConfig;
use crate::dispatch::Dispatcher;
use crate::error::PlatformError;

/// Largest page the mentions endpoint serves.
const MENTIONS_PAGE_SIZE: &str = "100";
/// Upper bound on pages read per poll.
const MAX_MENTION_PAGES: usize = 10;

#[derive(Debug, Clone, Deserialize)]
struct TwitterUser {
    id: String,
    name: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: TwitterUser,
}

#[derive(Debug, Serialize)]
struct TweetRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<TweetReply<'a>>,
}

#[derive(Debug, Serialize)]
struct TweetReply<'a> {
    in_reply_to_tweet_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TweetResponse {
    data: CreatedTweet,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MentionsResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    includes: Option<Includes>,
    #[serde(default)]
    meta: Option<MentionsMeta>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    #[serde(default)]
    author_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<TwitterUser>,
}

#[derive(Debug, Deserialize)]
struct MentionsMeta {
    #[serde(default)]
    newest_id: Option<String>,
    #[serde(default)]
    next_token: Option<String>,
}

impl MentionsResponse {
    fn next_token(&self) -> Option<&str> {
        self.meta.as_ref()?.next_token.as_deref()
    }

    /// Append an older page. `newest_id` stays that of the first page.
    fn append(&mut self, page: MentionsResponse) {
        self.data.extend(page.data);
        if let Some(includes) = page.includes {
            self.includes
                .get_or_insert(Includes { users: Vec::new() })
                .users
                .extend(includes.users);
        }
        let next_token = page.meta.and_then(|m| m.next_token);
        match &mut self.meta {
            Some(meta) => meta.next_token = next_token,
            None => {
                self.meta = Some(MentionsMeta {
                    newest_id: None,
                    next_token,
                })
            }
        }
    }
}

/// Drop the leading `@handle` tokens a reply or mention starts with.
fn strip_leading_mentions(text: &str) -> &str {
    let mut rest = text.trim_start();
    while rest.starts_with('@') {
        match rest.find(char::is_whitespace) {
            Some(idx) => rest = rest[idx..].trim_start(),
            None => return "",
        }
    }
    rest
}

fn mentions_to_events(response: MentionsResponse) -> Vec<Event> {
    let authors: HashMap<String, TwitterUser> = response
        .includes
        .map(|i| i.users.into_iter().map(|u| (u.id.clone(), u)).collect())
        .unwrap_or_default();

    // The API returns newest first; dispatch in chronological order
    response
        .data
        .into_iter()
        .rev()
        .filter_map(|tweet| {
            let author_id = tweet.author_id?;
            let sender_name = authors
                .get(&author_id)
                .map(|u| u.username.clone())
                .unwrap_or_else(|| author_id.clone());
            Some(Event {
                platform: Platform::Twitter,
                chat_id: author_id.clone(),
                message_id: Some(tweet.id),
                sender_id: author_id,
                sender_name,
                text: strip_leading_mentions(&tweet.text).to_string(),
                is_private: false,
                is_membership_join: false,
                mentions_bot: true,
            })
        })
        .collect()
}

/// Twitter API v2 adapter. Outbound messages are tweets; inbound events are
/// mentions of the bot account, polled.
pub struct TwitterPlatform {
    client: reqwest::Client,
    config: TwitterConfig,
    me: RwLock<Option<TwitterUser>>,
}

impl TwitterPlatform {
    pub fn new(config: TwitterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            me: RwLock::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PlatformError::Api {
            platform: Platform::Twitter,
            reason: format!("{}: {}", status, body),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PlatformError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.bearer_token)
            .query(query)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    async fn my_id(&self) -> Result<String, PlatformError> {
        self.me
            .read()
            .await
            .as_ref()
            .map(|u| u.id.clone())
            .ok_or(PlatformError::NotConnected {
                platform: Platform::Twitter,
            })
    }

    async fn fetch_mentions(
        &self,
        since_id: Option<&str>,
        pagination_token: Option<&str>,
    ) -> Result<MentionsResponse, PlatformError> {
        let id = self.my_id().await?;
        let mut query = vec![
            ("expansions", "author_id"),
            ("user.fields", "username"),
            ("max_results", MENTIONS_PAGE_SIZE),
        ];
        if let Some(since_id) = since_id {
            query.push(("since_id", since_id));
        }
        if let Some(token) = pagination_token {
            query.push(("pagination_token", token));
        }
        self.get_json(&format!("users/{}/mentions", id), &query).await
    }

    /// Every mention newer than `since_id`, across pages. Fails as a whole
    /// if any page fails, so the caller does not advance past unread pages.
    async fn fetch_new_mentions(&self, since_id: &str) -> Result<MentionsResponse, PlatformError> {
        let mut mentions = self.fetch_mentions(Some(since_id), None).await?;
        let mut pages = 1;
        while let Some(token) = mentions.next_token().map(str::to_string) {
            if pages == MAX_MENTION_PAGES {
                warn!(
                    "More than {} pages of new mentions, older ones are skipped",
                    MAX_MENTION_PAGES
                );
                break;
            }
            let page = self.fetch_mentions(Some(since_id), Some(&token)).await?;
            mentions.append(page);
            pages += 1;
        }
        debug!("Fetched {} new mention(s) in {} page(s)", mentions.data.len(), pages);
        Ok(mentions)
    }

    fn unsupported(operation: &'static str) -> PlatformError {
        PlatformError::Unsupported {
            platform: Platform::Twitter,
            operation,
        }
    }
}

#[async_trait]
impl ChatPlatform for TwitterPlatform {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn connect(&self) -> bool {
        match self.get_json::<UserResponse>("users/me", &[]).await {
            Ok(response) => {
                info!(
                    "Connected to Twitter as {} (@{})",
                    response.data.name, response.data.username
                );
                *self.me.write().await = Some(response.data);
                true
            }
            Err(e) => {
                warn!("Twitter users/me failed: {}", e);
                false
            }
        }
    }

    async fn disconnect(&self) {
        *self.me.write().await = None;
        debug!("Twitter platform disconnected");
    }

    async fn get_entity(&self, name: &str) -> Result<Entity, PlatformError> {
        let handle = name.trim().trim_start_matches('@');
        if handle.is_empty() {
            return Err(PlatformError::InvalidTarget(name.to_string()));
        }
        let response: UserResponse = self
            .get_json(&format!("users/by/username/{}", handle), &[])
            .await?;
        Ok(Entity {
            id: response.data.id,
            name: response.data.name,
        })
    }

    /// Post a tweet. `target` is informational: tweets are public, and a
    /// reply is threaded under `reply_to`.
    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        let request = TweetRequest {
            text,
            reply: reply_to.map(|id| TweetReply {
                in_reply_to_tweet_id: id,
            }),
        };
        debug!("Posting tweet for {} (reply to {:?})", target, reply_to);
        let response = self
            .client
            .post(self.url("tweets"))
            .bearer_auth(&self.config.bearer_token)
            .json(&request)
            .send()
            .await?;
        let created: TweetResponse = self.check(response).await?.json().await?;
        Ok(created.data.id)
    }

    async fn send_with_attachment(
        &self,
        _target: &str,
        _text: &str,
        _attachment: &Attachment,
        _reply_to: Option<&str>,
    ) -> Result<String, PlatformError> {
        Err(Self::unsupported("send_with_attachment"))
    }

    async fn mute(
        &self,
        _group: &str,
        _user: &str,
        _until: Option<DateTime<Utc>>,
    ) -> Result<(), PlatformError> {
        Err(Self::unsupported("mute"))
    }

    async fn unmute(&self, _group: &str, _user: &str) -> Result<(), PlatformError> {
        Err(Self::unsupported("unmute"))
    }
}

/// Poll mentions every `poll_interval_secs` until `shutdown` fires. Replies
/// go out through `platform`.
pub async fn listen(
    twitter: Arc<TwitterPlatform>,
    router: Arc<Dispatcher>,
    platform: Arc<dyn ChatPlatform>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(twitter.config.poll_interval_secs);
    info!("Starting Twitter mention poller (every {:?})", interval);

    // Skip the backlog: only mentions after startup are answered
    let mut since_id = match twitter.fetch_mentions(None, None).await {
        Ok(response) => response.meta.and_then(|m| m.newest_id),
        Err(e) => {
            warn!("Initial Twitter mention fetch failed: {}", e);
            None
        }
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("Twitter mention poller stopped");
                return;
            }
        }

        let fetched = match since_id.as_deref() {
            Some(since) => twitter.fetch_new_mentions(since).await,
            // Nothing to resume from yet; read the latest page only
            None => twitter.fetch_mentions(None, None).await,
        };
        match fetched {
            Ok(mut response) => {
                if let Some(newest) = response.meta.take().and_then(|m| m.newest_id) {
                    since_id = Some(newest);
                }
                for event in mentions_to_events(response) {
                    router.dispatch(&event, platform.as_ref()).await;
                }
            }
            Err(e) => warn!("Failed to fetch Twitter mentions: {}", e),
        }
    }
}
