//! DeletionService - removes an owner's file: object first, record second.
//!
//! A failed object delete leaves the record untouched; an orphaned object is
//! reclaimable, a record pointing at a live but unlisted object is not. A
//! failed record delete after the object is gone leaves a dangling record
//! that is reported to the [`ConsistencyMonitor`].

use super::{
    consistency::ConsistencyMonitor,
    metadata_repository::{FileRepository, RepoError},
    object_store::{ObjectStore, StoreError},
};
use crate::{errors::FailureKind, models::file_record::FileRecord};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("looking up file `{key}` failed: {source}")]
    Lookup { key: String, source: RepoError },
    #[error("deleting object `{key}` failed, record kept: {source}")]
    StoreDelete { key: String, source: StoreError },
    #[error("object `{key}` deleted but its record could not be: {source}")]
    RecordDelete { key: String, source: RepoError },
}

impl DeleteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeleteError::NotFound(_) => FailureKind::Validation,
            DeleteError::Lookup { .. } | DeleteError::StoreDelete { .. } => {
                FailureKind::TransientInfrastructure
            }
            DeleteError::RecordDelete { .. } => FailureKind::Consistency,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            DeleteError::NotFound(_) => "Document not found.".to_string(),
            DeleteError::StoreDelete { .. } => {
                "Failed to delete the document from storage.".to_string()
            }
            _ => "An error occurred while deleting the document.".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct DeletionService {
    store: Arc<dyn ObjectStore>,
    repository: Arc<dyn FileRepository>,
    monitor: Arc<ConsistencyMonitor>,
    bucket: String,
}

impl DeletionService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        repository: Arc<dyn FileRepository>,
        monitor: Arc<ConsistencyMonitor>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            repository,
            monitor,
            bucket: bucket.into(),
        }
    }

    /// Delete `store_key` on behalf of `owner_id`.
    ///
    /// Keys that do not exist and keys of other owners both report
    /// `NotFound` without touching either store.
    pub async fn delete_file(
        &self,
        store_key: &str,
        owner_id: i64,
    ) -> Result<FileRecord, DeleteError> {
        let record = self
            .repository
            .find_file(store_key)
            .await
            .map_err(|source| DeleteError::Lookup {
                key: store_key.to_string(),
                source,
            })?
            .filter(|record| record.owner_id == owner_id)
            .ok_or_else(|| {
                warn!(owner_id, store_key, "delete.not_found_or_foreign");
                DeleteError::NotFound(store_key.to_string())
            })?;

        if let Err(source) = self.store.delete(&self.bucket, store_key).await {
            error!(
                owner_id,
                store_key, "delete.store_failed, file record left untouched: {}", source
            );
            return Err(DeleteError::StoreDelete {
                key: store_key.to_string(),
                source,
            });
        }

        match self.repository.delete_file_record(store_key).await {
            Ok(true) => {
                info!(owner_id, store_key, "delete.ok");
                Ok(record)
            }
            Ok(false) => {
                warn!(owner_id, store_key, "delete.record_already_gone");
                Ok(record)
            }
            Err(source) => {
                self.monitor
                    .dangling_record(store_key, owner_id, &source.to_string());
                Err(DeleteError::RecordDelete {
                    key: store_key.to_string(),
                    source,
                })
            }
        }
    }
}
