//! Server hop: upstream connector, frame emitter and the HTTP handlers.

pub mod emitter;
pub mod handler;
pub mod health;
pub mod upstream;

pub use emitter::{EmitContext, RelayStream};
pub use upstream::{Completion, CompletionRequest, UpstreamConnector, WireMessage};
