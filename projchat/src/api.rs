//! REST collaborators of the chat session.
//!
//! The initial message page, the roster and message deletion go through the
//! dashboard's REST API rather than the channel connection. [`ChatApi`] is
//! the seam; [`HttpChatApi`] talks to a real server with `reqwest` and
//! [`StaticChatApi`] serves fixed data in memory.

use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use projchat_proto::member::Member;
use projchat_proto::message::{ChannelId, Message, MessageId};

/// Errors returned by [`ChatApi`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The base URL cannot be used to build endpoints.
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),

    /// The request did not complete (DNS, refused, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("API error (HTTP {status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),
}

/// REST operations the chat session depends on.
pub trait ChatApi: Send + Sync + 'static {
    /// Messages already in the channel, in any order.
    fn fetch_initial_messages(
        &self,
        channel_id: &ChannelId,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Members who can be mentioned in the channel.
    fn fetch_roster(
        &self,
        channel_id: &ChannelId,
    ) -> impl std::future::Future<Output = Result<Vec<Member>, ApiError>> + Send;

    /// Delete a message. Other clients learn about it through a
    /// `message-deleted` broadcast.
    fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// [`ChatApi`] over HTTP with bearer-token authentication.
///
/// Endpoints, relative to the base URL:
/// - `GET channels/{id}/messages`
/// - `GET channels/{id}/members`
/// - `DELETE channels/{id}/messages/{message_id}`
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl HttpChatApi {
    /// Create a client for `base_url` (e.g. `https://dash.example.com/api`).
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidUrl`] if `base_url` does not parse or cannot have
    /// path segments; [`ApiError::Network`] if the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        tracing::debug!(%url, "GET");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}

/// Turn a non-success response into [`ApiError::Status`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), %message, "API request failed");
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

impl ChatApi for HttpChatApi {
    async fn fetch_initial_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>, ApiError> {
        let url = self.endpoint(&["channels", channel_id.as_str(), "messages"])?;
        let messages: Vec<Message> = self.get_json(url).await?;
        let total = messages.len();
        let valid: Vec<Message> = messages
            .into_iter()
            .filter(|m| m.id.is_canonical() && m.edit_flags_consistent())
            .collect();
        if valid.len() != total {
            tracing::warn!(
                dropped = total - valid.len(),
                channel = %channel_id,
                "ignoring malformed messages in initial fetch"
            );
        }
        Ok(valid)
    }

    async fn fetch_roster(&self, channel_id: &ChannelId) -> Result<Vec<Member>, ApiError> {
        let url = self.endpoint(&["channels", channel_id.as_str(), "members"])?;
        self.get_json(url).await
    }

    async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&[
            "channels",
            channel_id.as_str(),
            "messages",
            message_id.as_str(),
        ])?;
        tracing::debug!(%url, "DELETE");
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// [`ChatApi`] serving fixed data, for tests and offline demos.
#[derive(Debug, Default)]
pub struct StaticChatApi {
    messages: Mutex<Vec<Message>>,
    roster: Vec<Member>,
    deleted: Mutex<Vec<MessageId>>,
}

impl StaticChatApi {
    /// Serve `messages` and `roster` for every channel.
    #[must_use]
    pub fn new(messages: Vec<Message>, roster: Vec<Member>) -> Self {
        Self {
            messages: Mutex::new(messages),
            roster,
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Ids deleted so far, in call order.
    #[must_use]
    pub fn deleted(&self) -> Vec<MessageId> {
        self.deleted.lock().clone()
    }
}

impl ChatApi for StaticChatApi {
    async fn fetch_initial_messages(&self, channel_id: &ChannelId) -> Result<Vec<Message>, ApiError> {
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| &m.channel_id == channel_id)
            .cloned()
            .collect())
    }

    async fn fetch_roster(&self, _channel_id: &ChannelId) -> Result<Vec<Member>, ApiError> {
        Ok(self.roster.clone())
    }

    async fn delete_message(
        &self,
        _channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), ApiError> {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| &m.id != message_id);
        if messages.len() == before {
            return Err(ApiError::Status {
                status: 404,
                message: format!("message {message_id} not found"),
            });
        }
        self.deleted.lock().push(message_id.clone());
        Ok(())
    }
}
