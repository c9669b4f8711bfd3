use std::time::Duration;

use chatlink_core::{ChatId, Id, Message, MessageRecord, OutgoingMessage};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestError {
    #[error("invalid api endpoint: {0}")]
    Endpoint(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl RestError {
    /// Whether repeating the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RestError::Network(_) | RestError::Timeout | RestError::Server { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: ChatId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub unread_count: usize,
}

/// Persistence calls the timeline store depends on.
pub trait RestApi: Send + Sync + 'static {
    /// Newest-first page of at most `limit` messages older than `before`.
    fn fetch_messages(
        &self,
        chat_id: &ChatId,
        limit: usize,
        before: Option<&Id>,
    ) -> BoxFuture<'static, Result<Vec<Message>, RestError>>;

    fn post_message(&self, message: &OutgoingMessage) -> BoxFuture<'static, Result<Message, RestError>>;

    fn fetch_chats(&self) -> BoxFuture<'static, Result<Vec<ChatSummary>, RestError>>;
}

#[derive(Deserialize)]
struct MessagesBody {
    #[serde(default)]
    messages: Option<Vec<MessageRecord>>,
}

#[derive(Deserialize)]
struct MessageBody {
    message: MessageRecord,
}

#[derive(Deserialize)]
struct ChatsBody {
    #[serde(default)]
    chats: Option<Vec<ChatSummary>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`RestApi`] over the backend's JSON API with bearer-token auth.
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpRestClient {
    pub fn new(
        api_base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RestError> {
        let mut base =
            Url::parse(api_base_url).map_err(|err| RestError::Endpoint(err.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RestError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base,
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RestError> {
        self.base
            .join(path)
            .map_err(|err| RestError::Endpoint(err.to_string()))
    }
}

impl RestApi for HttpRestClient {
    fn fetch_messages(
        &self,
        chat_id: &ChatId,
        limit: usize,
        before: Option<&Id>,
    ) -> BoxFuture<'static, Result<Vec<Message>, RestError>> {
        let mut query = vec![("chat_id", chat_id.to_string()), ("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let request = self
            .endpoint("messages")
            .map(|url| self.http.get(url).bearer_auth(&self.token).query(&query));

        async move {
            let body: MessagesBody = read_json(request?).await?;
            let messages: Vec<Message> = body
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(Message::from)
                .collect();
            debug!(count = messages.len(), "fetched message page");
            Ok(messages)
        }
        .boxed()
    }

    fn post_message(&self, message: &OutgoingMessage) -> BoxFuture<'static, Result<Message, RestError>> {
        let request = self
            .endpoint("messages")
            .map(|url| self.http.post(url).bearer_auth(&self.token).json(message));

        async move {
            let body: MessageBody = read_json(request?).await?;
            Ok(Message::from(body.message))
        }
        .boxed()
    }

    fn fetch_chats(&self) -> BoxFuture<'static, Result<Vec<ChatSummary>, RestError>> {
        let request = self
            .endpoint("chats")
            .map(|url| self.http.get(url).bearer_auth(&self.token));

        async move {
            let body: ChatsBody = read_json(request?).await?;
            Ok(body.chats.unwrap_or_default())
        }
        .boxed()
    }
}

async fn read_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, RestError> {
    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    if !status.is_success() {
        let fallback = status.canonical_reason().unwrap_or("request failed").to_owned();
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or(fallback);
        return Err(if status.is_server_error() {
            RestError::Server {
                status: status.as_u16(),
                message,
            }
        } else {
            RestError::Rejected {
                status: status.as_u16(),
                message,
            }
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|err| RestError::Decode(err.to_string()))
}

fn classify(err: reqwest::Error) -> RestError {
    if err.is_timeout() {
        RestError::Timeout
    } else {
        RestError::Network(err.to_string())
    }
}
