//! Read and edit the metadata derived from a file.

use super::{AppState, Principal, file_handlers::owned_record};
use crate::{
    errors::AppError,
    models::metadata_record::{MetadataRecord, MetadataUpdate},
};
use axum::{
    Json,
    extract::{Path, State},
};
use tracing::{error, info};

/// GET `/metadata/{*key}`
pub async fn get_metadata(
    State(state): State<AppState>,
    Principal(owner_id): Principal,
    Path(key): Path<String>,
) -> Result<Json<MetadataRecord>, AppError> {
    let metadata = state
        .repository
        .get_metadata(&key, owner_id)
        .await
        .map_err(|err| {
            error!(owner_id, store_key = %key, "metadata.get_failed: {}", err);
            AppError::internal("Could not load metadata.")
        })?;

    match metadata {
        Some(metadata) => Ok(Json(metadata)),
        // The worker may not have created the row yet.
        None => {
            owned_record(&state, &key, owner_id).await?;
            Ok(Json(MetadataRecord::shell(key, owner_id)))
        }
    }
}

/// PUT `/metadata/{*key}` - replace the editable fields.
pub async fn put_metadata(
    State(state): State<AppState>,
    Principal(owner_id): Principal,
    Path(key): Path<String>,
    Json(update): Json<MetadataUpdate>,
) -> Result<Json<MetadataRecord>, AppError> {
    owned_record(&state, &key, owner_id).await?;

    let record = update.into_record(key.clone(), owner_id);
    let updated = match state.repository.ensure_metadata(&key, owner_id).await {
        Ok(_) => state.repository.update_metadata(&record).await,
        Err(err) => Err(err),
    }
    .map_err(|err| {
        error!(owner_id, store_key = %key, "metadata.update_failed: {}", err);
        AppError::internal("Could not save metadata.")
    })?;

    if !updated {
        return Err(AppError::not_found("Document not found."));
    }
    info!(owner_id, store_key = %key, "metadata.updated");
    Ok(Json(record))
}
