use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and a config summary. Never includes the API key.
pub fn health_handler(state: &AppState) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "chat-relay is running",
        "config": {
            "upstream_host": state.upstream.url().host_str().unwrap_or_default(),
            "default_model": config.upstream.default_model,
            "max_tokens": config.upstream.max_tokens,
            "features": {
                "log_level": config.features.log_level,
                "forward_passthrough_lines": config.features.forward_passthrough_lines,
            }
        }
    }))
}
