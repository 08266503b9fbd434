//! src/services/ingestion_service.rs
//!
//! IngestionService - ties the object write, the file record insert and the
//! processing notification into one logical operation.
//!
//! Order is fixed: object first (so a record never points at a missing
//! object), then record + notification inside one database transaction,
//! then commit. When anything after the object write fails, the object is
//! deleted again. If that delete fails too, the orphan is reported to the
//! [`ConsistencyMonitor`] and the caller receives a generic failure.

use super::{
    consistency::ConsistencyMonitor,
    metadata_repository::{FileRepository, FileTransaction, RepoError},
    object_store::{ObjectStore, StoreError},
    queue_client::{NotificationQueue, QueueError},
    validation::{self, FileUpload, ValidatedFile, ValidationFailure, ValidationPolicy},
};
use crate::{
    errors::FailureKind,
    models::{
        file_record::{FileCategory, FileRecord},
        notification::FileNotification,
        store_key::StoreKey,
    },
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct IngestRequest {
    /// Authenticated principal.
    pub owner_id: i64,
    pub category: FileCategory,
    pub upload: FileUpload,
}

#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub record: FileRecord,
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Rejected(#[from] ValidationFailure),
    #[error("storing object `{key}` failed: {source}")]
    Storage { key: String, source: StoreError },
    #[error("recording file `{key}` failed: {source}")]
    Metadata { key: String, source: RepoError },
    #[error("queueing notification for `{key}` failed: {source}")]
    Notification { key: String, source: QueueError },
    #[error("object `{key}` of owner {owner_id} left orphaned after `{cause}`: {compensation}")]
    Inconsistent {
        key: String,
        owner_id: i64,
        cause: String,
        compensation: StoreError,
    },
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Rejected(_) => FailureKind::Validation,
            IngestError::Storage { .. }
            | IngestError::Metadata { .. }
            | IngestError::Notification { .. } => FailureKind::TransientInfrastructure,
            IngestError::Inconsistent { .. } => FailureKind::Consistency,
        }
    }

    /// Message safe to show to the uploader.
    pub fn user_message(&self) -> String {
        match self {
            IngestError::Rejected(failure) => failure.to_string(),
            IngestError::Storage { .. } => "Internal error during upload.".to_string(),
            _ => "Internal error finalizing upload.".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct IngestionService {
    store: Arc<dyn ObjectStore>,
    repository: Arc<dyn FileRepository>,
    queue: Arc<dyn NotificationQueue>,
    monitor: Arc<ConsistencyMonitor>,

    /// Bucket every object of this deployment lands in.
    bucket: String,

    validation: ValidationPolicy,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        repository: Arc<dyn FileRepository>,
        queue: Arc<dyn NotificationQueue>,
        monitor: Arc<ConsistencyMonitor>,
        bucket: impl Into<String>,
        validation: ValidationPolicy,
    ) -> Self {
        Self {
            store,
            repository,
            queue,
            monitor,
            bucket: bucket.into(),
            validation,
        }
    }

    pub fn validation_policy(&self) -> &ValidationPolicy {
        &self.validation
    }

    /// Validate `request.upload`, then store, record and announce it.
    pub async fn ingest_file(&self, request: IngestRequest) -> Result<IngestReceipt, IngestError> {
        let IngestRequest {
            owner_id,
            category,
            upload,
        } = request;

        let original_name = upload.filename.clone();
        let file = validation::validate(upload, &self.validation).inspect_err(|failure| {
            warn!(owner_id, file = %original_name, "ingest.rejected: {}", failure);
        })?;

        let key = StoreKey::generate(owner_id, &file.filename, Utc::now());
        self.ingest_validated(owner_id, category, file, key).await
    }

    /// Run the durable part of an ingestion under an already chosen key.
    pub async fn ingest_validated(
        &self,
        owner_id: i64,
        category: FileCategory,
        file: ValidatedFile,
        key: StoreKey,
    ) -> Result<IngestReceipt, IngestError> {
        let store_key = key.to_string();

        if let Err(source) = self.store.ensure_container_exists(&self.bucket).await {
            error!(bucket = %self.bucket, store_key = %store_key, "ingest.upload_abort_bucket_unavailable: {}", source);
            return Err(IngestError::Storage {
                key: store_key,
                source,
            });
        }
        if let Err(source) = self
            .store
            .put(&self.bucket, &store_key, file.bytes.clone())
            .await
        {
            error!(owner_id, store_key = %store_key, "ingest.upload_failed: {}", source);
            return Err(IngestError::Storage {
                key: store_key,
                source,
            });
        }

        let record = FileRecord {
            store_key,
            owner_id,
            category,
            original_filename: file.filename,
            size_bytes: file.bytes.len() as i64,
            uploaded_at: key.created_at,
            content_hash: Some(file.content_hash),
            mime_type: file.sniffed_mime,
        };

        match self.record_and_notify(&record).await {
            Ok(message_id) => {
                info!(
                    owner_id,
                    store_key = %record.store_key,
                    message_id = %message_id,
                    "ingest.ok"
                );
                Ok(IngestReceipt { record, message_id })
            }
            Err(failure) => Err(self.compensate(&record, failure).await),
        }
    }

    /// Insert the record and send the notification inside one transaction,
    /// committing only when both succeeded.
    async fn record_and_notify(&self, record: &FileRecord) -> Result<String, IngestError> {
        let key = || record.store_key.clone();

        let mut tx = self
            .repository
            .begin()
            .await
            .map_err(|source| IngestError::Metadata { key: key(), source })?;

        if let Err(source) = tx.create_file_record(record).await {
            rollback(tx, &record.store_key).await;
            return Err(IngestError::Metadata { key: key(), source });
        }

        let notification = FileNotification::from(record);
        let message_id = match self.queue.send(&notification).await {
            Ok(message_id) => message_id,
            Err(source) => {
                rollback(tx, &record.store_key).await;
                return Err(IngestError::Notification { key: key(), source });
            }
        };

        if let Err(source) = tx.commit().await {
            // consumers drop notifications whose record does not exist
            warn!(store_key = %record.store_key, message_id = %message_id, "ingest.notification_orphaned");
            return Err(IngestError::Metadata { key: key(), source });
        }

        Ok(message_id)
    }

    /// Remove the object written for `record` after a later step failed.
    async fn compensate(&self, record: &FileRecord, failure: IngestError) -> IngestError {
        error!(
            owner_id = record.owner_id,
            store_key = %record.store_key,
            "ingest.finalize_failed, deleting stored object: {}",
            failure
        );

        match self.store.delete(&self.bucket, &record.store_key).await {
            Ok(()) => {
                info!(store_key = %record.store_key, "ingest.compensated");
                failure
            }
            Err(compensation) => {
                self.monitor.orphaned_object(
                    &record.store_key,
                    record.owner_id,
                    &failure.to_string(),
                    &compensation.to_string(),
                );
                IngestError::Inconsistent {
                    key: record.store_key.clone(),
                    owner_id: record.owner_id,
                    cause: failure.to_string(),
                    compensation,
                }
            }
        }
    }
}

async fn rollback(tx: Box<dyn FileTransaction>, store_key: &str) {
    if let Err(err) = tx.rollback().await {
        // dropping the connection discards the transaction anyway
        warn!(store_key, "ingest.rollback_failed: {}", err);
    }
}
