//! Client hop: relay transport, stream consumer and the chat session.

pub mod consumer;
pub mod session;
pub mod transport;

use crate::stream::FailureReason;

pub use consumer::{ConsumedReply, StreamConsumer, StreamFailure};
pub use session::{
    ChatMessage, ChatSession, ExchangeMode, ExchangeOutcome, ReplySink, Role, SessionError,
    SessionState,
};
pub use transport::{HttpRelayClient, RelayReply, RelayRequest, RelayTransport, WholeReply};

/// Failure of one exchange with the relay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The relay answered with an error status and JSON body.
    #[error("Relay error: status={status}, message={message}")]
    Relay {
        status: u16,
        reason: FailureReason,
        message: String,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Invalid relay response: {0}")]
    Decode(String),
    /// The byte stream broke before the terminal frame.
    #[error("Stream interrupted: {message}")]
    Stream { partial: String, message: String },
    /// The relay reported an upstream failure through a failure frame.
    #[error("Upstream failed mid-stream: {message}")]
    Interrupted {
        reason: FailureReason,
        message: String,
    },
}

impl ClientError {
    #[must_use]
    pub fn reason(&self) -> FailureReason {
        match self {
            ClientError::Relay { reason, .. } | ClientError::Interrupted { reason, .. } => *reason,
            ClientError::Transport(_) | ClientError::Stream { .. } => FailureReason::Unavailable,
            ClientError::Decode(_) => FailureReason::Unknown,
        }
    }

    /// Text shown in place of a reply that never arrived.
    #[must_use]
    pub fn display_text(&self) -> String {
        match self {
            ClientError::Relay { message, .. } | ClientError::Interrupted { message, .. } => {
                message.clone()
            }
            ClientError::Transport(_) | ClientError::Stream { .. } => {
                "Network error, check the connection and try again".to_string()
            }
            ClientError::Decode(_) => "Received an unreadable reply".to_string(),
        }
    }
}
