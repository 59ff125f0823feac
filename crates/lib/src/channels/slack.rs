//! Slack Web API client: auth.test, chat.postMessage, chat.update, conversations.replies
//! and apps.connections.open (Socket Mode URL).

use crate::channels::sink::{MessageSink, SinkError, ThreadMessage};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

const SLACK_API_BASE: &str = "https://slack.com/api";
const REPLIES_PAGE_SIZE: &str = "200";

#[derive(Debug, Deserialize)]
struct AuthTestResponse {
    user_id: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ts: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpenResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RepliesResponse {
    #[serde(default)]
    messages: Vec<RepliesMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct RepliesMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Slack Web API client for one bot installation.
pub struct SlackClient {
    api_base: String,
    bot_token: String,
    app_token: Option<String>,
    page_limit: usize,
    client: reqwest::Client,
}

impl SlackClient {
    pub fn new(bot_token: String, app_token: Option<String>) -> Self {
        Self {
            api_base: SLACK_API_BASE.to_string(),
            bot_token,
            app_token,
            page_limit: 10,
            client: reqwest::Client::new(),
        }
    }

    /// Use a different API base (tests, proxies).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Cap on conversations.replies pages read per thread scan.
    pub fn with_page_limit(mut self, pages: usize) -> Self {
        self.page_limit = pages.max(1);
        self
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    /// Decode a Slack response: HTTP status, then the `ok` flag, then the method-specific body.
    async fn decode<T: DeserializeOwned>(method: &str, res: reqwest::Response) -> Result<T, SinkError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SinkError::Api(format!("{} failed: {} {}", method, status, body)));
        }
        let value: serde_json::Value = res.json().await?;
        if !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            let error = value
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(SinkError::Api(format!("{} returned {}", method, error)));
        }
        serde_json::from_value(value)
            .map_err(|e| SinkError::Api(format!("{}: unexpected response: {}", method, e)))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        method: &str,
        token: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SinkError> {
        let res = self
            .client
            .get(self.url(method))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        Self::decode(method, res).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        method: &str,
        token: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, SinkError> {
        let mut req = self.client.post(self.url(method)).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await?;
        Self::decode(method, res).await
    }

    /// auth.test: returns the bot's user id.
    pub async fn auth_test(&self) -> Result<String, SinkError> {
        let res: AuthTestResponse = self.post("auth.test", &self.bot_token, None).await?;
        log::info!(
            "slack: authenticated as {} ({})",
            res.user.as_deref().unwrap_or("?"),
            res.user_id
        );
        Ok(res.user_id)
    }

    /// apps.connections.open: a fresh Socket Mode WebSocket URL. Requires the app-level token.
    pub async fn open_socket_url(&self) -> Result<String, SinkError> {
        let token = self
            .app_token
            .as_deref()
            .ok_or_else(|| SinkError::Api("slack app token not configured".to_string()))?;
        let res: ConnectionsOpenResponse = self.post("apps.connections.open", token, None).await?;
        Ok(res.url)
    }
}

#[async_trait]
impl MessageSink for SlackClient {
    async fn post_message(&self, channel: &str, thread_ts: &str, text: &str) -> Result<String, SinkError> {
        let body = serde_json::json!({ "channel": channel, "thread_ts": thread_ts, "text": text });
        let res: PostMessageResponse = self.post("chat.postMessage", &self.bot_token, Some(body)).await?;
        Ok(res.ts)
    }

    async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<(), SinkError> {
        let body = serde_json::json!({ "channel": channel, "ts": ts, "text": text });
        let _: serde_json::Value = self.post("chat.update", &self.bot_token, Some(body)).await?;
        Ok(())
    }

    async fn thread_messages(&self, channel: &str, root_ts: &str) -> Result<Vec<ThreadMessage>, SinkError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        for page in 0..self.page_limit {
            let res: RepliesResponse = {
                let mut query = vec![("channel", channel), ("ts", root_ts), ("limit", REPLIES_PAGE_SIZE)];
                if let Some(ref c) = cursor {
                    query.push(("cursor", c.as_str()));
                }
                self.get("conversations.replies", &self.bot_token, &query).await?
            };
            messages.extend(res.messages.into_iter().map(|m| ThreadMessage {
                ts: m.ts,
                user: m.user,
                text: m.text.unwrap_or_default(),
            }));
            cursor = res
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
            if page + 1 == self.page_limit {
                log::warn!(
                    "slack: thread {}/{} has more than {} pages of replies, transcript truncated",
                    channel,
                    root_ts,
                    self.page_limit
                );
            }
        }
        Ok(messages)
    }
}
