//! Stream codec shared by the relay and the client.
//!
//! The same [`decoder::LineDecoder`] and [`translator::translate_line`] run on
//! both hops; only the [`translator::Dialect`] differs.

pub mod decoder;
pub mod frame;
pub mod translator;

pub use decoder::{line_stream, LineDecoder};
pub use frame::{FailureReason, RelayFrame};
pub use translator::{translate_line, Dialect, EventRecord, EventTranslator, MalformedKind};
