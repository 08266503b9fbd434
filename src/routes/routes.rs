//! Defines the HTTP routes of the ingestion service.
//!
//! - `POST   /files`          - multipart upload (`file`, `category`)
//! - `GET    /files`          - list the caller's files
//! - `GET    /files/{*key}`   - download a file
//! - `DELETE /files/{*key}`   - delete a file and its metadata
//! - `GET    /metadata/{*key}`, `PUT /metadata/{*key}` - derived metadata
//!
//! Store keys contain slashes (`uploads/user-1/...`), hence the wildcards.

use crate::handlers::{
    AppState,
    file_handlers::{delete_file, download_file, list_files, upload_file},
    health_handlers::{healthz, readyz},
    metadata_handlers::{get_metadata, put_metadata},
};
use axum::{Router, extract::DefaultBodyLimit, routing::get};

/// Multipart framing on top of the raw file size.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Request body limit for uploads of at most `max_filesize_kb`.
pub fn upload_body_limit(max_filesize_kb: u64) -> DefaultBodyLimit {
    let limit = usize::try_from(max_filesize_kb.saturating_mul(1024))
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);
    DefaultBodyLimit::max(limit)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files", get(list_files).post(upload_file))
        .route("/files/{*key}", get(download_file).delete(delete_file))
        .route("/metadata/{*key}", get(get_metadata).put(put_metadata))
}
