pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod relay;
pub mod routing;
pub mod server;
pub mod state;
pub mod stream;

mod util;
