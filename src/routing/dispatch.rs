use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::RelayError;
use crate::relay::handler::{apply_cors_headers, chat_handler, preflight_handler};
use crate::relay::health::health_handler;
use crate::state::AppState;

enum RouteMatch {
    Health,
    Chat,
    ChatPreflight,
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    let response = match route {
        RouteMatch::Health => health_handler(&state).into_response(),
        RouteMatch::Chat => {
            let limit = state.config.server.body_limit_bytes;
            let body_bytes = match read_request_body(body, limit).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(limit, error = %err, "rejected chat request body");
                    let mut response = err.into_response();
                    apply_cors_headers(response.headers_mut());
                    return Ok(response);
                }
            };
            chat_handler(state, body_bytes).await
        }
        RouteMatch::ChatPreflight => preflight_handler(),
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body, limit: usize) -> Result<bytes::Bytes, RelayError> {
    body::to_bytes(body, limit).await.map_err(|err| {
        RelayError::InvalidRequest(format!(
            "Request body unreadable or larger than {limit} bytes: {err}"
        ))
    })
}

fn match_route(method: &Method, path: &str, base_path: &str) -> RouteMatch {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    match path {
        "/" => {
            if method == Method::GET {
                RouteMatch::Health
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/api/chat" | "/api/chat/" => match *method {
            Method::POST => RouteMatch::Chat,
            Method::OPTIONS => RouteMatch::ChatPreflight,
            _ => RouteMatch::MethodNotAllowed,
        },
        _ => RouteMatch::NotFound,
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}
