use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Config levels map onto tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - anything else is handed to `EnvFilter` as-is, falling back to INFO
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();
    if level == "DISABLED" {
        return;
    }

    let filter = EnvFilter::try_new(filter_directive(&level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    // A subscriber may already be installed (tests, embedding binaries).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

fn filter_directive(level: &str) -> &str {
    match level {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    }
}

/// Per-stream counters collected by the relay emitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub deltas: u64,
    pub content_bytes: u64,
    pub malformed: u64,
    pub passthrough: u64,
    /// The upstream sent its own `[DONE]`.
    pub upstream_terminal: bool,
    pub failed: bool,
}

/// Log a finished streaming relay at INFO level.
pub fn log_stream_complete(
    request_id: &uuid::Uuid,
    model: &str,
    stats: &StreamStats,
    start_time: Instant,
) {
    info!(
        request_id = %request_id,
        model = model,
        mode = "stream",
        deltas = stats.deltas,
        content_bytes = stats.content_bytes,
        malformed = stats.malformed,
        passthrough = stats.passthrough,
        upstream_terminal = stats.upstream_terminal,
        failed = stats.failed,
        duration_seconds = start_time.elapsed().as_secs_f64(),
        "request completed"
    );
}

/// Log a finished whole-response relay at INFO level.
pub fn log_request_complete(
    request_id: &uuid::Uuid,
    model: &str,
    total_tokens: Option<u64>,
    start_time: Instant,
) {
    info!(
        request_id = %request_id,
        model = model,
        mode = "non_stream",
        total_tokens = total_tokens.unwrap_or(0),
        duration_seconds = start_time.elapsed().as_secs_f64(),
        "request completed"
    );
}
