use crate::stream::FailureReason;

/// Error type for the relay side.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Map an upstream HTTP status code to a failure reason.
#[must_use]
pub fn reason_from_upstream_status(status: u16) -> FailureReason {
    match status {
        400 | 404 | 422 => FailureReason::InvalidRequest,
        401 | 403 => FailureReason::Unauthorized,
        429 => FailureReason::RateLimited,
        500..=599 => FailureReason::Unavailable,
        _ => FailureReason::Unknown,
    }
}

impl RelayError {
    #[must_use]
    pub fn reason(&self) -> FailureReason {
        match self {
            RelayError::InvalidRequest(_) => FailureReason::InvalidRequest,
            RelayError::Upstream { status, .. } => reason_from_upstream_status(*status),
            RelayError::Transport(_) => FailureReason::Unavailable,
            RelayError::Config(_) | RelayError::InvalidResponse(_) | RelayError::Internal(_) => {
                FailureReason::Unknown
            }
        }
    }

    /// Status code returned to the client.
    ///
    /// Upstream failures keep the upstream status so the client sees the
    /// same class the provider reported.
    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        match self {
            RelayError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            RelayError::Upstream { status, .. } => http::StatusCode::from_u16(*status)
                .ok()
                .filter(|code| code.is_client_error() || code.is_server_error())
                .unwrap_or(http::StatusCode::BAD_GATEWAY),
            RelayError::Transport(_) => http::StatusCode::SERVICE_UNAVAILABLE,
            RelayError::InvalidResponse(_) => http::StatusCode::BAD_GATEWAY,
            RelayError::Config(_) | RelayError::Internal(_) => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short user-facing summary for the `error` field.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            RelayError::InvalidRequest(message) => message.clone(),
            RelayError::Upstream { status, .. } => {
                format!("AI service temporarily unavailable ({status})")
            }
            RelayError::Transport(_) => {
                "Unable to reach the AI service, check the network connection".to_string()
            }
            RelayError::InvalidResponse(_) => "AI service returned an invalid response".to_string(),
            RelayError::Config(_) | RelayError::Internal(_) => {
                "Internal server error, try again later".to_string()
            }
        }
    }

    /// Optional hint for the `details` field.
    #[must_use]
    pub fn details(&self) -> Option<String> {
        match self {
            RelayError::Upstream { status: 401, .. } => Some("Invalid API key".to_string()),
            RelayError::Upstream { message, .. } if !message.is_empty() => Some(message.clone()),
            RelayError::Upstream { .. } => Some("Try again later".to_string()),
            RelayError::InvalidResponse(message) => Some(message.clone()),
            _ => None,
        }
    }
}

/// Format an error as `(status, JSON body)`.
#[must_use]
pub fn format_error(err: &RelayError) -> (http::StatusCode, serde_json::Value) {
    let mut body = serde_json::json!({
        "error": err.summary(),
        "reason": err.reason().as_str(),
    });
    if let Some(details) = err.details() {
        body["details"] = serde_json::Value::String(details);
    }
    (err.status(), body)
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_from_upstream_status() {
        assert_eq!(reason_from_upstream_status(401), FailureReason::Unauthorized);
        assert_eq!(reason_from_upstream_status(403), FailureReason::Unauthorized);
        assert_eq!(reason_from_upstream_status(429), FailureReason::RateLimited);
        assert_eq!(reason_from_upstream_status(503), FailureReason::Unavailable);
        assert_eq!(reason_from_upstream_status(400), FailureReason::InvalidRequest);
        assert_eq!(reason_from_upstream_status(302), FailureReason::Unknown);
    }

    #[test]
    fn test_unauthorized_upstream_body() {
        let err = RelayError::Upstream {
            status: 401,
            message: "bad key".to_string(),
        };
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
        assert_eq!(body["reason"], "unauthorized");
        assert_eq!(body["details"], "Invalid API key");
        assert!(body["error"].as_str().unwrap().contains("401"));
    }

    #[test]
    fn test_transport_error_is_unavailable() {
        let err = RelayError::Transport("connection refused".to_string());
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["reason"], "unavailable");
        assert!(body.get("details").is_none());
    }

    #[test]
    fn test_non_error_upstream_status_maps_to_bad_gateway() {
        let err = RelayError::Upstream {
            status: 302,
            message: String::new(),
        };
        assert_eq!(err.status(), http::StatusCode::BAD_GATEWAY);
        assert_eq!(err.reason(), FailureReason::Unknown);
    }

    #[test]
    fn test_invalid_request_is_400() {
        let err = RelayError::InvalidRequest("messages cannot be empty".to_string());
        let (status, body) = format_error(&err);
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "messages cannot be empty");
        assert_eq!(body["reason"], "invalid_request");
    }
}
