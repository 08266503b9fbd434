//! HTTP handlers for uploading, listing, downloading and deleting files.
//!
//! Ingestion and deletion run in their own task so that a client hanging up
//! mid-request cannot interrupt a sequence between its store and database
//! steps.

use super::{AppState, Principal};
use crate::{
    errors::AppError,
    models::{
        file_record::{FileCategory, FileRecord},
        store_key::sanitize_filename,
    },
    services::{
        ingestion_service::{IngestError, IngestRequest},
        object_store::StoreError,
        validation::{FileUpload, ValidationFailure},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, State,
        multipart::MultipartError,
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub key: String,
    pub message_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct FileList {
    pub files: Vec<FileRecord>,
}

/// POST `/files` - multipart form with a `file` part and a `category` field.
pub async fn upload_file(
    State(state): State<AppState>,
    Principal(owner_id): Principal,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut upload: Option<FileUpload> = None;
    let mut category: Option<FileCategory> = None;

    let limit_kb = state.ingestion.validation_policy().max_size_kb;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_failure(owner_id, limit_kb, err))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| multipart_failure(owner_id, limit_kb, err))?;
                upload = Some(FileUpload {
                    filename,
                    content_type,
                    bytes,
                });
            }
            Some("category") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|_| AppError::bad_request("Malformed upload."))?;
                category = Some(
                    raw.parse::<FileCategory>()
                        .map_err(|_| AppError::bad_request("Unknown document category."))?,
                );
            }
            _ => {}
        }
    }

    let upload = upload
        .filter(|upload| !upload.filename.is_empty())
        .ok_or_else(|| AppError::bad_request("No file uploaded."))?;
    let category = category.unwrap_or(FileCategory::Resume);

    let ingestion = state.ingestion.clone();
    let receipt = tokio::spawn(async move {
        ingestion
            .ingest_file(IngestRequest {
                owner_id,
                category,
                upload,
            })
            .await
    })
    .await
    .map_err(|err| {
        error!(owner_id, "upload.task_failed: {}", err);
        AppError::internal("Internal error during upload.")
    })??;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            success: true,
            message: "File uploaded successfully.".into(),
            key: receipt.record.store_key,
            message_id: receipt.message_id,
        }),
    ))
}

/// A body cut off by the request size limit is an oversized file, not a
/// malformed request.
fn multipart_failure(owner_id: i64, limit_kb: u64, err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(owner_id, limit_kb, "upload.rejected: body exceeds limit");
        return IngestError::Rejected(ValidationFailure::TooLarge {
            size_kb: limit_kb.saturating_add(1),
            limit_kb,
        })
        .into();
    }
    warn!(owner_id, "upload.multipart_invalid: {}", err);
    AppError::bad_request("Malformed upload.")
}

/// GET `/files` - the caller's files, newest first.
pub async fn list_files(
    State(state): State<AppState>,
    Principal(owner_id): Principal,
) -> Result<Json<FileList>, AppError> {
    let files = state.repository.list_files(owner_id).await.map_err(|err| {
        error!(owner_id, "files.list_failed: {}", err);
        AppError::internal("Could not load documents.")
    })?;
    Ok(Json(FileList { files }))
}

/// GET `/files/{*key}` - download the stored bytes.
pub async fn download_file(
    State(state): State<AppState>,
    Principal(owner_id): Principal,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let record = owned_record(&state, &key, owner_id).await?;

    let bytes = state
        .store
        .get(&state.bucket, &record.store_key)
        .await
        .map_err(|err| match err {
            StoreError::ObjectNotFound { .. } => {
                warn!(owner_id, store_key = %key, "download.object_missing");
                AppError::not_found("Document not found.")
            }
            other => {
                error!(owner_id, store_key = %key, "download.store_failed: {}", other);
                AppError::internal("Could not read the document.")
            }
        })?;

    let content_type = record
        .mime_type
        .as_deref()
        .and_then(|mime| HeaderValue::from_str(mime).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize_filename(&record.original_filename)
    );

    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// DELETE `/files/{*key}`
pub async fn delete_file(
    State(state): State<AppState>,
    Principal(owner_id): Principal,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deletion = state.deletion.clone();
    tokio::spawn(async move { deletion.delete_file(&key, owner_id).await })
        .await
        .map_err(|err| {
            error!(owner_id, "delete.task_failed: {}", err);
            AppError::internal("An error occurred while deleting the document.")
        })??;

    Ok(Json(DeleteResponse {
        success: true,
        message: "Document deleted.".into(),
    }))
}

/// Loads `key` when it belongs to `owner_id`; anything else is a 404.
pub(super) async fn owned_record(
    state: &AppState,
    key: &str,
    owner_id: i64,
) -> Result<FileRecord, AppError> {
    state
        .repository
        .find_file(key)
        .await
        .map_err(|err| {
            error!(owner_id, store_key = key, "files.lookup_failed: {}", err);
            AppError::internal("Could not load the document.")
        })?
        .filter(|record| record.owner_id == owner_id)
        .ok_or_else(|| AppError::not_found("Document not found."))
}
