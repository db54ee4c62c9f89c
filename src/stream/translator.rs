//! Line classification for both hops.
//!
//! [`translate_line`] is a pure function from one decoded line to an
//! [`EventRecord`]. It never fails: a payload that cannot be understood comes
//! back as [`EventRecord::Malformed`] and the caller keeps reading.

use serde::Deserialize;

use super::frame::{is_done_payload, FailureReason};

/// Literal terminal payload shared by the upstream and relay protocols.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// Which side's payload schema a line is interpreted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// OpenAI-style completion chunks: `{"choices":[{"delta":{"content":..}}]}`.
    Upstream,
    /// The relay's own frames: `{"content":..,"model":..}`.
    Relay,
}

impl Dialect {
    #[must_use]
    pub fn hop(self) -> &'static str {
        match self {
            Dialect::Upstream => "upstream",
            Dialect::Relay => "relay",
        }
    }
}

/// Why a data payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Not JSON, or JSON cut short.
    Syntax,
    /// Valid JSON with an unexpected structure.
    Shape,
}

/// One classified line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRecord {
    ContentDelta {
        text: String,
        model: Option<String>,
    },
    Terminal,
    /// A non-`data:` line, forwarded verbatim by the relay.
    Passthrough(String),
    Malformed {
        kind: MalformedKind,
        detail: String,
    },
    /// Relay-reported upstream failure after streaming began.
    UpstreamFailure {
        reason: FailureReason,
        message: String,
    },
}

#[derive(Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
}

#[derive(Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: Option<UpstreamDelta>,
}

#[derive(Deserialize)]
struct UpstreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct RelayPayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<FailureReason>,
}

/// Classify one line. Returns `None` for lines that carry nothing to act on:
/// blank separators, metadata-only chunks, and (on the relay dialect) lines
/// outside the `data:` convention.
#[must_use]
pub fn translate_line(line: &str, dialect: Dialect) -> Option<EventRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Some(payload) = strip_data_prefix(trimmed) else {
        return match dialect {
            Dialect::Upstream => Some(EventRecord::Passthrough(line.to_owned())),
            Dialect::Relay => None,
        };
    };

    if is_done_payload(payload) {
        return Some(EventRecord::Terminal);
    }

    match dialect {
        Dialect::Upstream => translate_upstream_payload(payload),
        Dialect::Relay => translate_relay_payload(payload),
    }
}

#[inline]
fn strip_data_prefix(line: &str) -> Option<&str> {
    let value = line.strip_prefix(DATA_PREFIX)?;
    Some(value.strip_prefix(' ').unwrap_or(value).trim())
}

fn translate_upstream_payload(payload: &str) -> Option<EventRecord> {
    let chunk: UpstreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(err) => return Some(malformed(&err)),
    };
    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty())?;
    Some(EventRecord::ContentDelta {
        text,
        model: chunk.model,
    })
}

fn translate_relay_payload(payload: &str) -> Option<EventRecord> {
    let frame: RelayPayload = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(err) => return Some(malformed(&err)),
    };
    if let Some(message) = frame.error {
        return Some(EventRecord::UpstreamFailure {
            reason: frame.reason.unwrap_or(FailureReason::Unknown),
            message,
        });
    }
    let text = frame.content.filter(|content| !content.is_empty())?;
    Some(EventRecord::ContentDelta {
        text,
        model: frame.model,
    })
}

fn malformed(err: &serde_json::Error) -> EventRecord {
    let kind = if err.is_data() {
        MalformedKind::Shape
    } else {
        MalformedKind::Syntax
    };
    EventRecord::Malformed {
        kind,
        detail: err.to_string(),
    }
}

/// Stateful wrapper that enforces a single terminal per stream.
///
/// Once a terminal record has been returned every further line translates to
/// `None`, whatever the upstream keeps sending.
#[derive(Debug)]
pub struct EventTranslator {
    dialect: Dialect,
    terminated: bool,
}

impl EventTranslator {
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            terminated: false,
        }
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn translate(&mut self, line: &str) -> Option<EventRecord> {
        if self.terminated {
            return None;
        }
        let record = translate_line(line, self.dialect)?;
        if record == EventRecord::Terminal {
            self.terminated = true;
        }
        Some(record)
    }
}
