//! Relay wire frames.
//!
//! Every frame is one `data:` line followed by a blank line:
//!
//! ```text
//! data: {"content":"Hel","model":"gpt-4o-mini"}
//!
//! data: [DONE]
//!
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::translator::DONE_SENTINEL;

const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Machine-readable failure class shared by error responses and failure frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidRequest,
    Unauthorized,
    RateLimited,
    Unavailable,
    Unknown,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InvalidRequest => "invalid_request",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Unavailable => "unavailable",
            FailureReason::Unknown => "unknown",
        }
    }
}

/// One record written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Content { content: String, model: String },
    /// Upstream broke after streaming began. Always followed by `Terminal`.
    Failure {
        reason: FailureReason,
        error: String,
    },
    Terminal,
}

#[derive(Serialize)]
struct ContentPayload<'a> {
    content: &'a str,
    model: &'a str,
}

#[derive(Serialize)]
struct FailurePayload<'a> {
    error: &'a str,
    reason: FailureReason,
}

impl RelayFrame {
    /// Encode into SSE wire bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            RelayFrame::Content { content, model } => data_frame(&ContentPayload {
                content,
                model,
            }),
            RelayFrame::Failure { reason, error } => data_frame(&FailurePayload {
                error,
                reason: *reason,
            }),
            RelayFrame::Terminal => Bytes::from_static(DONE_FRAME.as_bytes()),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayFrame::Terminal)
    }
}

fn data_frame<T: Serialize>(payload: &T) -> Bytes {
    // Serializing string-only structs cannot fail.
    let json = serde_json::to_string(payload).unwrap_or_else(|_| String::from("{}"));
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(&json);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Encode a passthrough line: the raw text plus its newline.
#[must_use]
pub fn passthrough_line(raw: &str) -> Bytes {
    let mut out = String::with_capacity(raw.len() + 1);
    out.push_str(raw);
    out.push('\n');
    Bytes::from(out)
}

/// Whether `payload` (already stripped of `data:`) is the terminal sentinel.
#[must_use]
pub fn is_done_payload(payload: &str) -> bool {
    payload.trim() == DONE_SENTINEL
}
