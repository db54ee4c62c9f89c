//! `POST /api/chat`: request validation, upstream call, response shaping.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;

use crate::config::UpstreamConfig;
use crate::error::RelayError;
use crate::observability::log_request_complete;
use crate::relay::emitter::{EmitContext, RelayStream};
use crate::relay::upstream::{CompletionRequest, WireMessage};
use crate::state::AppState;

const ALLOWED_ROLES: &[&str] = &["system", "user", "assistant"];

/// Body accepted by the chat endpoint.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Parse and validate a chat request body.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] for malformed JSON, an empty
/// message list, an unknown role, or an out-of-range parameter.
pub fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, RelayError> {
    let request: ChatRequest = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest(
            "messages cannot be empty".to_string(),
        ));
    }
    if let Some(bad) = request
        .messages
        .iter()
        .find(|message| !ALLOWED_ROLES.contains(&message.role.as_str()))
    {
        return Err(RelayError::InvalidRequest(format!(
            "unsupported message role '{}'",
            bad.role
        )));
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(RelayError::InvalidRequest(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
    }
    if request.max_tokens == Some(0) {
        return Err(RelayError::InvalidRequest(
            "max_tokens must be greater than 0".to_string(),
        ));
    }
    if request
        .model
        .as_deref()
        .is_some_and(|model| model.trim().is_empty())
    {
        return Err(RelayError::InvalidRequest("model cannot be blank".to_string()));
    }
    Ok(request)
}

/// Build the upstream body: system prompt first, then the conversation,
/// with configured defaults filling anything the client left out.
#[must_use]
pub fn build_completion_request(request: ChatRequest, defaults: &UpstreamConfig) -> CompletionRequest {
    let system_prompt = defaults.system_prompt.trim();
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(WireMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        });
    }
    messages.extend(request.messages);

    CompletionRequest {
        model: request
            .model
            .unwrap_or_else(|| defaults.default_model.clone()),
        messages,
        temperature: request.temperature.unwrap_or(defaults.temperature),
        max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
        stream: request.stream.unwrap_or(false),
    }
}

/// Handle one chat request. Never fails: errors become JSON error responses.
pub async fn chat_handler(state: Arc<AppState>, body: Bytes) -> Response {
    let request_seq = state.next_request_seq();
    let request_id = state.request_uuid(request_seq);
    let mut response = match handle_chat(&state, request_id, &body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(
                request_id = %request_id,
                status = err.status().as_u16(),
                reason = err.reason().as_str(),
                error = %err,
                "chat request failed"
            );
            err.into_response()
        }
    };
    apply_cors_headers(response.headers_mut());
    response
}

async fn handle_chat(
    state: &AppState,
    request_id: uuid::Uuid,
    body: &[u8],
) -> Result<Response, RelayError> {
    let started = Instant::now();
    let request = parse_chat_request(body)?;
    let upstream_request = build_completion_request(request, &state.config.upstream);
    tracing::debug!(
        request_id = %request_id,
        model = %upstream_request.model,
        stream = upstream_request.stream,
        messages = upstream_request.messages.len(),
        "relaying chat request"
    );

    if !upstream_request.stream {
        let completion = state.upstream.complete(&upstream_request).await?;
        log_request_complete(
            &request_id,
            &upstream_request.model,
            completion.total_tokens(),
            started,
        );
        if let Some(reported) = completion.model.as_deref() {
            tracing::debug!(request_id = %request_id, reported, "upstream reported model");
        }
        return Ok(Json(serde_json::json!({
            "message": completion.message,
            "usage": completion.usage,
            "model": upstream_request.model,
        }))
        .into_response());
    }

    let upstream = state.upstream.open_stream(&upstream_request).await?;
    let relay = RelayStream::new(
        upstream,
        EmitContext {
            request_id,
            model: Arc::from(upstream_request.model.as_str()),
            forward_passthrough: state.config.features.forward_passthrough_lines,
        },
    );
    Ok(sse_ok_response(Body::from_stream(relay)))
}

fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

/// Permissive CORS headers added to every chat response.
pub fn apply_cors_headers(headers: &mut http::HeaderMap) {
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        http::HeaderValue::from_static("*"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_METHODS,
        http::HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_HEADERS,
        http::HeaderValue::from_static("Content-Type"),
    );
}

/// CORS preflight for the chat endpoint.
#[must_use]
pub fn preflight_handler() -> Response {
    let mut response = http::StatusCode::OK.into_response();
    apply_cors_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<ChatRequest, RelayError> {
        parse_chat_request(body.as_bytes())
    }

    #[test]
    fn test_empty_messages_rejected() {
        let err = parse(r#"{"messages":[]}"#).unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
        assert!(parse("{}").is_err());
        assert!(parse("not json").is_err());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let err = parse(r#"{"messages":[{"role":"tool","content":"x"}]}"#).unwrap_err();
        assert!(err.to_string().contains("tool"));
    }

    #[test]
    fn test_out_of_range_parameters_rejected() {
        assert!(parse(r#"{"messages":[{"role":"user","content":"x"}],"temperature":9}"#).is_err());
        assert!(parse(r#"{"messages":[{"role":"user","content":"x"}],"max_tokens":0}"#).is_err());
        assert!(parse(r#"{"messages":[{"role":"user","content":"x"}],"model":"  "}"#).is_err());
    }

    #[test]
    fn test_defaults_and_system_prompt_applied() {
        let request = parse(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        let defaults = UpstreamConfig::default();
        let upstream = build_completion_request(request, &defaults);
        assert_eq!(upstream.model, "gemini-2.0-flash");
        assert_eq!(upstream.max_tokens, 10_000);
        assert!(!upstream.stream);
        assert_eq!(upstream.messages.len(), 2);
        assert_eq!(upstream.messages[0].role, "system");
        assert_eq!(upstream.messages[1].content, "hi");
    }

    #[test]
    fn test_client_overrides_and_empty_system_prompt() {
        let request = parse(
            r#"{"messages":[{"role":"user","content":"hi"}],"model":"m","temperature":0.2,"max_tokens":5,"stream":true}"#,
        )
        .unwrap();
        let defaults = UpstreamConfig {
            system_prompt: "   ".to_string(),
            ..UpstreamConfig::default()
        };
        let upstream = build_completion_request(request, &defaults);
        assert_eq!(upstream.model, "m");
        assert!((upstream.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(upstream.max_tokens, 5);
        assert!(upstream.stream);
        assert_eq!(upstream.messages.len(), 1);
    }

    #[test]
    fn test_preflight_has_cors_headers() {
        let response = preflight_handler();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            response.headers()[http::header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert_eq!(
            response.headers()[http::header::ACCESS_CONTROL_ALLOW_METHODS],
            "POST, OPTIONS"
        );
    }
}
