//! Connection accept loop.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

use crate::routing::dispatch::{dispatch_request, normalize_base_path};
use crate::state::AppState;

/// Bind the listener described by `server.host` and `server.port`.
///
/// # Errors
///
/// Returns the bind error.
pub async fn bind(state: &AppState) -> std::io::Result<TcpListener> {
    let server = &state.config.server;
    TcpListener::bind(format!("{}:{}", server.host, server.port)).await
}

/// Serve connections from `listener` until the task is cancelled.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    let base_path = Arc::<str>::from(normalize_base_path(&state.config.server.base_path));
    let conn_builder = AutoBuilder::new(TokioExecutor::new());

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                tracing::warn!("accept error: {err}");
                continue;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("failed to enable TCP_NODELAY for {remote_addr}: {err}");
        }

        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let request_state = Arc::clone(&state);
        let request_base_path = Arc::clone(&base_path);
        let hyper_service = service_fn(move |request: Request<Incoming>| {
            dispatch_request(
                Arc::clone(&request_state),
                Arc::clone(&request_base_path),
                request.map(Body::new),
            )
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, hyper_service).await {
                tracing::debug!("failed to serve connection from {remote_addr}: {err:#}");
            }
        });
    }
}
