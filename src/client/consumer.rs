//! Incremental decode of the relay stream on the client side.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use super::ClientError;
use crate::stream::{line_stream, Dialect, EventRecord, EventTranslator, FailureReason};

/// Failure reported by the relay through a failure frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub reason: FailureReason,
    pub message: String,
}

/// Outcome of a stream that reached its terminal (or a clean end of input).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsumedReply {
    pub text: String,
    pub model: Option<String>,
    pub failure: Option<StreamFailure>,
}

/// Drives the shared decoder and the relay-dialect translator over a byte stream.
#[derive(Debug)]
pub struct StreamConsumer {
    translator: EventTranslator,
}

impl StreamConsumer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            translator: EventTranslator::new(Dialect::Relay),
        }
    }

    /// Read `byte_stream` to its terminal, calling `on_delta` with each piece
    /// of content in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stream`] carrying the text received so far when
    /// the byte stream fails before the terminal frame.
    pub async fn consume<S, F>(
        mut self,
        byte_stream: S,
        mut on_delta: F,
    ) -> Result<ConsumedReply, ClientError>
    where
        S: Stream<Item = Result<Bytes, ClientError>> + Send + 'static,
        F: FnMut(&str),
    {
        let mut reply = ConsumedReply::default();
        let mut lines = std::pin::pin!(line_stream(byte_stream));

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    return Err(ClientError::Stream {
                        partial: reply.text,
                        message: err.to_string(),
                    });
                }
            };
            let Some(record) = self.translator.translate(&line) else {
                continue;
            };
            match record {
                EventRecord::ContentDelta { text, model } => {
                    reply.text.push_str(&text);
                    if model.is_some() {
                        reply.model = model;
                    }
                    on_delta(&text);
                }
                EventRecord::Terminal => return Ok(reply),
                EventRecord::UpstreamFailure { reason, message } => {
                    reply.failure = Some(StreamFailure { reason, message });
                }
                EventRecord::Malformed { kind, detail } => {
                    tracing::debug!(
                        hop = self.translator.dialect().hop(),
                        kind = ?kind,
                        detail = %detail,
                        "skipping malformed stream line"
                    );
                }
                EventRecord::Passthrough(_) => {}
            }
        }

        tracing::debug!("relay stream ended without terminal frame");
        Ok(reply)
    }
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}
