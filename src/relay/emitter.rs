//! Re-framing of the upstream event stream into relay frames.

use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;
use smallvec::SmallVec;

use crate::observability::{log_stream_complete, StreamStats};
use crate::stream::frame::passthrough_line;
use crate::stream::{Dialect, EventRecord, EventTranslator, FailureReason, LineDecoder, RelayFrame};

/// Frames decoded from one upstream chunk, waiting to be written.
struct PendingFrames {
    frames: SmallVec<[Bytes; 4]>,
    head: usize,
}

impl PendingFrames {
    fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    fn push(&mut self, frame: Bytes) {
        self.frames.push(frame);
    }

    #[inline]
    fn pop_front(&mut self) -> Option<Bytes> {
        if self.head >= self.frames.len() {
            return None;
        }
        let frame = std::mem::take(&mut self.frames[self.head]);
        self.head += 1;
        if self.head == self.frames.len() {
            self.frames.clear();
            self.head = 0;
        }
        Some(frame)
    }
}

/// Per-stream context used for logging.
#[derive(Debug, Clone)]
pub struct EmitContext {
    pub request_id: uuid::Uuid,
    /// Model the relay asked for; stamped on every content frame.
    pub model: Arc<str>,
    pub forward_passthrough: bool,
}

struct EmitState {
    translator: EventTranslator,
    pending: PendingFrames,
    ctx: EmitContext,
    stats: StreamStats,
    terminal_queued: bool,
}

impl EmitState {
    fn handle_line(&mut self, line: &str) {
        let Some(record) = self.translator.translate(line) else {
            return;
        };
        match record {
            EventRecord::ContentDelta { text, .. } => {
                self.stats.deltas += 1;
                self.stats.content_bytes += text.len() as u64;
                self.push_frame(&RelayFrame::Content {
                    content: text,
                    model: self.ctx.model.to_string(),
                });
            }
            EventRecord::Terminal => {
                self.stats.upstream_terminal = true;
                self.queue_terminal();
            }
            EventRecord::Passthrough(raw) => {
                self.stats.passthrough += 1;
                if self.ctx.forward_passthrough {
                    self.pending.push(passthrough_line(&raw));
                }
            }
            EventRecord::Malformed { kind, detail } => {
                self.stats.malformed += 1;
                tracing::warn!(
                    request_id = %self.ctx.request_id,
                    hop = self.translator.dialect().hop(),
                    kind = ?kind,
                    detail = %detail,
                    "skipping malformed stream line"
                );
            }
            EventRecord::UpstreamFailure { reason, message } => {
                // Not produced by the upstream dialect.
                tracing::debug!(?reason, %message, "ignoring failure record on upstream hop");
            }
        }
    }

    fn push_frame(&mut self, frame: &RelayFrame) {
        self.pending.push(frame.encode());
    }

    fn queue_terminal(&mut self) {
        if self.terminal_queued {
            return;
        }
        self.terminal_queued = true;
        self.push_frame(&RelayFrame::Terminal);
    }

    fn queue_failure(&mut self, error: impl Display) {
        if self.terminal_queued {
            return;
        }
        self.stats.failed = true;
        tracing::warn!(
            request_id = %self.ctx.request_id,
            error = %error,
            "upstream stream failed after streaming began"
        );
        self.push_frame(&RelayFrame::Failure {
            reason: FailureReason::Unavailable,
            error: format!("Upstream stream interrupted: {error}"),
        });
        self.queue_terminal();
    }
}

pin_project! {
    /// Relay response body: upstream bytes in, relay frames out.
    ///
    /// Exactly one terminal frame is written, always last. The upstream is
    /// dropped as soon as the terminal is queued and never polled again.
    pub struct RelayStream<S> {
        #[pin]
        upstream: Option<S>,
        decoder: LineDecoder,
        state: EmitState,
        started: Instant,
        finished: bool,
    }

    impl<S> PinnedDrop for RelayStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if !*this.finished {
                tracing::debug!(
                    request_id = %this.state.ctx.request_id,
                    buffered = this.decoder.buffered_len(),
                    "client closed relay stream before terminal"
                );
            }
            log_stream_complete(
                &this.state.ctx.request_id,
                &this.state.ctx.model,
                &this.state.stats,
                *this.started,
            );
        }
    }
}

impl<S> RelayStream<S> {
    #[must_use]
    pub fn new(upstream: S, ctx: EmitContext) -> Self {
        Self {
            upstream: Some(upstream),
            decoder: LineDecoder::new(),
            state: EmitState {
                translator: EventTranslator::new(Dialect::Upstream),
                pending: PendingFrames::new(),
                ctx,
                stats: StreamStats::default(),
                terminal_queued: false,
            },
            started: Instant::now(),
            finished: false,
        }
    }
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame) = this.state.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }
            if this.state.terminal_queued {
                *this.finished = true;
                this.upstream.set(None);
                continue;
            }

            let Some(upstream) = this.upstream.as_mut().as_pin_mut() else {
                *this.finished = true;
                continue;
            };
            match upstream.poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    for line in this.decoder.feed(&chunk) {
                        this.state.handle_line(&line);
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    for line in std::mem::take(this.decoder).finish() {
                        this.state.handle_line(&line);
                    }
                    this.state.queue_failure(err);
                }
                Poll::Ready(None) => {
                    for line in std::mem::take(this.decoder).finish() {
                        this.state.handle_line(&line);
                    }
                    if !this.state.terminal_queued {
                        tracing::debug!(
                            request_id = %this.state.ctx.request_id,
                            "upstream ended without terminal sentinel"
                        );
                    }
                    this.state.queue_terminal();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
