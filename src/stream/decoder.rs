//! Incremental line decoder shared by both hops.
//!
//! Bytes are split on `\n` before any text decoding happens, so a multi-byte
//! UTF-8 sequence that straddles two network chunks is only decoded once the
//! whole line is present. The undecoded remainder is the decoder's only state.

use bytes::{Buf, BytesMut};
use futures_util::Stream;
use memchr::memchr;

const INITIAL_BUFFER_CAPACITY: usize = 4096;

/// Incremental newline-delimited line decoder.
///
/// Feed it byte chunks of any size with [`LineDecoder::feed`]; it yields
/// every line completed by that chunk and carries the partial tail forward.
/// Call [`LineDecoder::finish`] once the input ends to flush the tail.
#[derive(Debug)]
pub struct LineDecoder {
    remainder: BytesMut,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            remainder: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Append `chunk` and return the lines it completes.
    ///
    /// The iterator is lazy: lines are decoded as it is advanced. Lines left
    /// undrained when it is dropped stay buffered and come out first on the
    /// next `feed` or on `finish`.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.remainder.extend_from_slice(chunk);
        Lines {
            remainder: &mut self.remainder,
        }
    }

    /// Signal end-of-input.
    ///
    /// Yields any complete lines still buffered, then whatever follows the
    /// last newline as one final line. That final line is empty when the
    /// input ended with a newline (or was empty), so rejoining every yielded
    /// line with `\n` reproduces the input exactly.
    #[must_use]
    pub fn finish(self) -> Finish {
        Finish {
            remainder: self.remainder,
            tail_pending: true,
        }
    }

    /// Number of bytes waiting for a newline.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.remainder.len()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn split_complete_line(remainder: &mut BytesMut) -> Option<String> {
    let newline = memchr(b'\n', remainder)?;
    let line = remainder.split_to(newline);
    remainder.advance(1);
    Some(decode_lossy(&line))
}

#[inline]
fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Lines completed by one [`LineDecoder::feed`] call.
#[derive(Debug)]
pub struct Lines<'a> {
    remainder: &'a mut BytesMut,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        split_complete_line(self.remainder)
    }
}

/// Remaining lines after end-of-input, including the final tail line.
#[derive(Debug)]
pub struct Finish {
    remainder: BytesMut,
    tail_pending: bool,
}

impl Iterator for Finish {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if let Some(line) = split_complete_line(&mut self.remainder) {
            return Some(line);
        }
        if !self.tail_pending {
            return None;
        }
        self.tail_pending = false;
        let tail = self.remainder.split();
        Some(decode_lossy(&tail))
    }
}

/// Turn a byte stream into a stream of decoded lines.
///
/// Pull-based: each poll drains buffered lines first and only reads the next
/// chunk when none are left. A transport error is yielded once and ends the
/// stream without flushing the partial tail. On clean end-of-input the tail is
/// flushed as the final line.
pub fn line_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, E>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    use futures_util::StreamExt;

    enum Phase {
        Reading(LineDecoder),
        Flushing(Finish),
        Done,
    }

    futures_util::stream::unfold(
        (Box::pin(byte_stream), Phase::Reading(LineDecoder::new())),
        |(mut stream, mut phase)| async move {
            loop {
                match phase {
                    Phase::Reading(mut decoder) => {
                        // Drain lines completed by earlier chunks before reading more.
                        if let Some(line) = split_complete_line(&mut decoder.remainder) {
                            return Some((Ok(line), (stream, Phase::Reading(decoder))));
                        }
                        match stream.as_mut().next().await {
                            Some(Ok(chunk)) => {
                                decoder.remainder.extend_from_slice(&chunk);
                                phase = Phase::Reading(decoder);
                            }
                            Some(Err(err)) => return Some((Err(err), (stream, Phase::Done))),
                            None => phase = Phase::Flushing(decoder.finish()),
                        }
                    }
                    Phase::Flushing(mut finish) => {
                        let line = finish.next()?;
                        return Some((Ok(line), (stream, Phase::Flushing(finish))));
                    }
                    Phase::Done => return None,
                }
            }
        },
    )
}
