//! Defines routes for the chunked upload API.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST /api/upload`: create an upload session
//!   - `POST /api/upload/chunk/{upload_id}/{chunk_id}`: write one chunk (multipart field `chunk`)
//!   - `GET  /api/upload/{upload_id}/status`: received chunk indices
//!   - `GET  /api/upload/{upload_id}/finished`: long-poll until the file is stored
//!   - `GET  /api/upload/{upload_id}/processed`: long-poll until post-processing is done
//!
//! - **Store endpoints**
//!   - `GET  /api/files/{digest}`: download a stored file

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            create_upload, get_file, upload_chunk, upload_finished, upload_processed,
            upload_status,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for all upload routes.
///
/// `max_chunk_bytes` bounds the request body of the chunk endpoint; the
/// multipart framing needs some headroom on top of the chunk itself.
pub fn routes(max_chunk_bytes: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload routes
        .route("/api/upload", post(create_upload))
        .route(
            "/api/upload/chunk/{upload_id}/{chunk_id}",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes + 64 * 1024)),
        )
        .route("/api/upload/{upload_id}/status", get(upload_status))
        .route("/api/upload/{upload_id}/finished", get(upload_finished))
        .route("/api/upload/{upload_id}/processed", get(upload_processed))
        // Store routes
        .route("/api/files/{digest}", get(get_file))
}
