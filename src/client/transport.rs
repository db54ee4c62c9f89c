//! HTTP transport from the client to the relay.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::ClientError;
use crate::config::ClientConfig;
use crate::relay::WireMessage;
use crate::stream::FailureReason;

/// Relay response body as a byte stream.
pub type ReplyBytes = BoxStream<'static, Result<Bytes, ClientError>>;

/// Body posted to the relay chat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayRequest {
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub stream: bool,
}

/// Whole-response reply from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WholeReply {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
}

pub enum RelayReply {
    Stream(ReplyBytes),
    Whole(WholeReply),
}

impl std::fmt::Debug for RelayReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayReply::Stream(_) => f.write_str("RelayReply::Stream(..)"),
            RelayReply::Whole(reply) => f.debug_tuple("RelayReply::Whole").field(reply).finish(),
        }
    }
}

/// Anything that can carry a chat request to the relay.
pub trait RelayTransport: Send + Sync {
    /// Post `request`. Resolves once the relay has answered: with the open
    /// byte stream for streaming requests, the parsed reply otherwise.
    fn send(
        &self,
        request: RelayRequest,
    ) -> impl Future<Output = Result<RelayReply, ClientError>> + Send;
}

#[derive(Deserialize)]
struct RelayErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    reason: Option<FailureReason>,
}

/// [`RelayTransport`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpRelayClient {
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when the relay URL is invalid or the
    /// HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let url = url::Url::parse(&config.relay_url)
            .map_err(|e| ClientError::Transport(format!("Invalid relay URL: {e}")))?;
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| ClientError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }

    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

impl RelayTransport for HttpRelayClient {
    async fn send(&self, request: RelayRequest) -> Result<RelayReply, ClientError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match response.bytes().await {
                Ok(body) => relay_error(status.as_u16(), &body),
                Err(err) => unreadable_error_body(status.as_u16(), &err),
            });
        }

        if request.stream {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| ClientError::Transport(e.to_string())))
                .boxed();
            return Ok(RelayReply::Stream(stream));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        serde_json::from_slice::<WholeReply>(&body)
            .map(RelayReply::Whole)
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

fn unreadable_error_body(status: u16, err: &dyn std::fmt::Display) -> ClientError {
    ClientError::Relay {
        status,
        reason: FailureReason::Unknown,
        message: format!("HTTP error {status} (error body unreadable: {err})"),
    }
}

fn relay_error(status: u16, body: &[u8]) -> ClientError {
    let parsed = serde_json::from_slice::<RelayErrorBody>(body).ok();
    let reason = parsed
        .as_ref()
        .and_then(|body| body.reason)
        .unwrap_or(FailureReason::Unknown);
    let message = match parsed {
        Some(RelayErrorBody {
            error: Some(error),
            details: Some(details),
            ..
        }) => format!("{error}: {details}"),
        Some(RelayErrorBody {
            error: Some(error), ..
        }) => error,
        _ => format!("HTTP error {status}"),
    };
    ClientError::Relay {
        status,
        reason,
        message,
    }
}
