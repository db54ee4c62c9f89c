mod request_id;

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::relay::upstream::UpstreamConnector;

pub use request_id::IdGenerator;

/// Shared application state accessible to all handlers. Immutable after startup.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamConnector,
    request_ids: IdGenerator,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, upstream: UpstreamConnector) -> Self {
        Self {
            config,
            upstream,
            request_ids: IdGenerator::new(),
        }
    }

    /// Build the state from config alone, resolving the upstream API key.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when no API key is available or the
    /// upstream HTTP client cannot be built.
    pub fn from_config(config: AppConfig) -> Result<Self, RelayError> {
        let api_key = config
            .upstream
            .resolve_api_key()
            .map_err(|err| RelayError::Config(err.to_string()))?;
        let upstream = UpstreamConnector::new(&config.server, &config.upstream, api_key)?;
        Ok(Self::new(config, upstream))
    }

    pub fn next_request_seq(&self) -> u64 {
        self.request_ids.next_seq()
    }

    #[must_use]
    pub fn request_uuid(&self, request_seq: u64) -> uuid::Uuid {
        self.request_ids.uuid_for(request_seq)
    }
}
