//! Defines routes for the upload API.
//!
//! ## Structure
//! - **Upload endpoints** (owner taken from `x-owner-id`)
//!   - `POST /api/files/upload-chunk`  -> one numbered chunk of a large file
//!   - `POST /api/files/upload-stream` -> a whole file as the raw request body
//!   - `POST /api/files/upload`        -> legacy `multipart/form-data` upload
//!
//! - **Probes**
//!   - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{upload_chunk, upload_form, upload_stream},
    },
    services::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the router. Bodies are streamed to disk, so axum's default
/// body limit is lifted on every upload route.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/files/upload-chunk", post(upload_chunk))
        .route("/api/files/upload-stream", post(upload_stream))
        .route("/api/files/upload", post(upload_form))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
}

/// Serve the full router on an ephemeral local port; returns its base URL.
#[cfg(test)]
pub async fn spawn_test_server(storage_root: &std::path::Path) -> String {
    let app = routes().with_state(AppState::new(storage_root));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
