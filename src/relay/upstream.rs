//! Upstream completion service client.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::RelayError;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Byte stream of an upstream streaming response body.
pub type UpstreamBytes = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// One conversation turn as sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// OpenAI-style chat-completions request body.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub temperature: f64,
    pub max_tokens: u64,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// A validated whole-response reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub message: String,
    pub model: Option<String>,
    pub usage: Option<serde_json::Value>,
}

impl Completion {
    #[must_use]
    pub fn total_tokens(&self) -> Option<u64> {
        self.usage
            .as_ref()?
            .get("total_tokens")
            .and_then(serde_json::Value::as_u64)
    }
}

fn build_reqwest_client(
    server: &ServerConfig,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, RelayError> {
    let pool_idle_timeout = if server.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(server.http_pool_idle_timeout_secs))
    };
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(server.http_pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(server.connect_timeout))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(server.timeout));

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| RelayError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Config(format!("Failed to build HTTP client: {err}")))
}

/// Issues completion requests against the configured upstream endpoint.
pub struct UpstreamConnector {
    client: reqwest::Client,
    url: url::Url,
    api_key: String,
}

impl UpstreamConnector {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when the endpoint URL or proxy is invalid.
    pub fn new(
        server: &ServerConfig,
        upstream: &UpstreamConfig,
        api_key: String,
    ) -> Result<Self, RelayError> {
        let url = url::Url::parse(&upstream.api_url)
            .map_err(|err| RelayError::Config(format!("Invalid upstream URL: {err}")))?;
        let client = build_reqwest_client(server, upstream.proxy.as_deref())?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, RelayError> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = response
                .bytes()
                .await
                .map_err(|e| RelayError::Transport(format!("Failed to read error body: {e}")))?;
            let message = sanitize_upstream_error(&body_bytes);
            tracing::warn!(
                status = status.as_u16(),
                message = %message,
                "upstream rejected completion request"
            );
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// Open a streaming completion. Resolves once the upstream has answered
    /// with a success status; the body is then read lazily.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Upstream`] for a non-success status and
    /// [`RelayError::Transport`] when the connection cannot be established.
    pub async fn open_stream(&self, request: &CompletionRequest) -> Result<UpstreamBytes, RelayError> {
        let response = self.send(request).await?;
        Ok(response.bytes_stream().boxed())
    }

    /// Run a whole-response completion and validate its shape.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidResponse`] when the document is not JSON
    /// or carries no choice, plus the errors of [`Self::open_stream`].
    pub async fn complete(&self, request: &CompletionRequest) -> Result<Completion, RelayError> {
        let response = self.send(request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Transport(format!("Failed to read upstream body: {e}")))?;
        parse_completion(&body)
    }
}

fn map_send_error(err: reqwest::Error) -> RelayError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RelayError::Transport(err.to_string())
    } else {
        RelayError::Internal(err.to_string())
    }
}

fn parse_completion(body: &[u8]) -> Result<Completion, RelayError> {
    let parsed: CompletionResponse = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidResponse(format!("Malformed completion body: {e}")))?;
    let Some(first) = parsed.choices.into_iter().next() else {
        return Err(RelayError::InvalidResponse(
            "Completion carries no choices".to_string(),
        ));
    };
    let message = first
        .message
        .and_then(|message| message.content)
        .unwrap_or_default();
    Ok(Completion {
        message,
        model: parsed.model,
        usage: parsed.usage,
    })
}

/// Reduce an upstream error body to a short message.
///
/// Prefers `error.message` from JSON bodies, then a plain string `error`,
/// then the lossy UTF-8 body, capped at 500 bytes.
pub(crate) fn sanitize_upstream_error(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        let error = json.get("error");
        if let Some(msg) = error
            .and_then(|e| e.get("message"))
            .and_then(serde_json::Value::as_str)
        {
            return truncate_message(msg);
        }
        if let Some(msg) = error.and_then(serde_json::Value::as_str) {
            return truncate_message(msg);
        }
    }
    truncate_message(String::from_utf8_lossy(body).trim())
}

fn truncate_message(msg: &str) -> String {
    if msg.len() <= MAX_ERROR_MESSAGE_LEN {
        return msg.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &msg[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_openai_error_shape() {
        let body = br#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(sanitize_upstream_error(body), "Incorrect API key provided");
    }

    #[test]
    fn test_sanitize_plain_string_error() {
        assert_eq!(sanitize_upstream_error(br#"{"error":"quota"}"#), "quota");
        assert_eq!(sanitize_upstream_error(b"  bad gateway \n"), "bad gateway");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(400);
        let sanitized = sanitize_upstream_error(long.as_bytes());
        assert!(sanitized.ends_with("..."));
        assert!(sanitized.len() <= MAX_ERROR_MESSAGE_LEN + 3);
    }

    #[test]
    fn test_parse_completion_ok() {
        let body = br#"{"model":"gpt-4o-mini","choices":[{"message":{"role":"assistant","content":"Hello"}}],"usage":{"total_tokens":7}}"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.message, "Hello");
        assert_eq!(completion.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(completion.total_tokens(), Some(7));
    }

    #[test]
    fn test_parse_completion_without_choices_is_invalid() {
        let err = parse_completion(br#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, RelayError::InvalidResponse(_)));
        let err = parse_completion(b"<html>").unwrap_err();
        assert!(matches!(err, RelayError::InvalidResponse(_)));
    }

    #[test]
    fn test_connector_rejects_bad_url() {
        let upstream = UpstreamConfig {
            api_url: "not a url".to_string(),
            ..UpstreamConfig::default()
        };
        let result = UpstreamConnector::new(&ServerConfig::default(), &upstream, "k".into());
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_connector_accepts_socks_proxy() {
        for proxy in ["socks5://127.0.0.1:1080", "socks5h://127.0.0.1:1080", "http://127.0.0.1:3128"] {
            let upstream = UpstreamConfig {
                proxy: Some(proxy.to_string()),
                ..UpstreamConfig::default()
            };
            let result = UpstreamConnector::new(&ServerConfig::default(), &upstream, "k".into());
            assert!(result.is_ok(), "proxy {proxy} rejected");
        }
    }
}
