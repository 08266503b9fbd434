//! Metadata repository: file records and their metadata rows in SQLite.
//!
//! Writes issued by the ingestion and deletion services go through a
//! [`FileTransaction`], which is rolled back in full unless committed.

use crate::{
    db,
    models::{file_record::FileRecord, metadata_record::MetadataRecord},
};
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("file record `{0}` already exists")]
    DuplicateKey(String),
    #[error("database call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// An open write scope. Dropping it without `commit` rolls everything back.
#[async_trait]
pub trait FileTransaction: Send {
    async fn create_file_record(&mut self, record: &FileRecord) -> RepoResult<()>;

    async fn commit(self: Box<Self>) -> RepoResult<()>;

    async fn rollback(self: Box<Self>) -> RepoResult<()>;
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn begin(&self) -> RepoResult<Box<dyn FileTransaction>>;

    async fn find_file(&self, store_key: &str) -> RepoResult<Option<FileRecord>>;

    /// Files of `owner_id`, newest first.
    async fn list_files(&self, owner_id: i64) -> RepoResult<Vec<FileRecord>>;

    /// Delete a file record and, by cascade, its metadata. Returns false
    /// when no row matched.
    async fn delete_file_record(&self, store_key: &str) -> RepoResult<bool>;

    async fn get_metadata(&self, store_key: &str, owner_id: i64)
    -> RepoResult<Option<MetadataRecord>>;

    /// Insert an empty metadata row unless one exists. Returns true when a
    /// row was inserted.
    async fn ensure_metadata(&self, store_key: &str, owner_id: i64) -> RepoResult<bool>;

    /// Overwrite the editable fields. Returns false when the owner has no
    /// metadata row for that key.
    async fn update_metadata(&self, record: &MetadataRecord) -> RepoResult<bool>;

    async fn ping(&self) -> RepoResult<()>;
}

const FILE_COLUMNS: &str = "store_key, owner_id, category, original_filename, size_bytes, \
                            uploaded_at, content_hash, mime_type";

const METADATA_COLUMNS: &str = "store_key, owner_id, name, primary_phone, primary_email, urls, \
                                linkedin, github, full_address, city, postal_code, country, \
                                birthday, work_experience";

#[derive(Clone, Debug)]
pub struct SqliteFileRepository {
    db: SqlitePool,

    /// Upper bound for any single statement.
    read_timeout: Duration,
}

impl SqliteFileRepository {
    pub fn new(db: SqlitePool, read_timeout: Duration) -> Self {
        Self { db, read_timeout }
    }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> RepoResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(RepoError::from),
        Err(_) => Err(RepoError::Timeout(limit)),
    }
}

pub struct SqliteFileTransaction {
    tx: Transaction<'static, Sqlite>,
    read_timeout: Duration,
}

#[async_trait]
impl FileTransaction for SqliteFileTransaction {
    async fn create_file_record(&mut self, record: &FileRecord) -> RepoResult<()> {
        let insert = sqlx::query(
            "INSERT INTO file_records (
                store_key, owner_id, category, original_filename, size_bytes,
                uploaded_at, content_hash, mime_type
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.store_key)
        .bind(record.owner_id)
        .bind(record.category)
        .bind(&record.original_filename)
        .bind(record.size_bytes)
        .bind(record.uploaded_at)
        .bind(&record.content_hash)
        .bind(&record.mime_type)
        .execute(&mut *self.tx);

        match timeout(self.read_timeout, insert).await {
            Ok(Ok(_)) => {
                debug!(store_key = %record.store_key, "db.file_record_staged");
                Ok(())
            }
            Ok(Err(err)) if db::is_unique_violation(&err) => {
                Err(RepoError::DuplicateKey(record.store_key.clone()))
            }
            Ok(Err(err)) => Err(RepoError::Sqlx(err)),
            Err(_) => Err(RepoError::Timeout(self.read_timeout)),
        }
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        bounded(self.read_timeout, self.tx.commit()).await
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        bounded(self.read_timeout, self.tx.rollback()).await
    }
}

#[async_trait]
impl FileRepository for SqliteFileRepository {
    async fn begin(&self) -> RepoResult<Box<dyn FileTransaction>> {
        let tx = bounded(self.read_timeout, self.db.begin()).await?;
        Ok(Box::new(SqliteFileTransaction {
            tx,
            read_timeout: self.read_timeout,
        }))
    }

    async fn find_file(&self, store_key: &str) -> RepoResult<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM file_records WHERE store_key = ?", FILE_COLUMNS);
        bounded(
            self.read_timeout,
            sqlx::query_as::<_, FileRecord>(&sql)
                .bind(store_key)
                .fetch_optional(&self.db),
        )
        .await
    }

    async fn list_files(&self, owner_id: i64) -> RepoResult<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM file_records WHERE owner_id = ? ORDER BY uploaded_at DESC, store_key DESC",
            FILE_COLUMNS
        );
        bounded(
            self.read_timeout,
            sqlx::query_as::<_, FileRecord>(&sql)
                .bind(owner_id)
                .fetch_all(&self.db),
        )
        .await
    }

    async fn delete_file_record(&self, store_key: &str) -> RepoResult<bool> {
        let mut tx = bounded(self.read_timeout, self.db.begin()).await?;
        let result = bounded(
            self.read_timeout,
            sqlx::query("DELETE FROM file_records WHERE store_key = ?")
                .bind(store_key)
                .execute(&mut *tx),
        )
        .await?;
        bounded(self.read_timeout, tx.commit()).await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(store_key, "db.file_record_deleted");
        }
        Ok(deleted)
    }

    async fn get_metadata(
        &self,
        store_key: &str,
        owner_id: i64,
    ) -> RepoResult<Option<MetadataRecord>> {
        let sql = format!(
            "SELECT {} FROM file_metadata WHERE store_key = ? AND owner_id = ?",
            METADATA_COLUMNS
        );
        bounded(
            self.read_timeout,
            sqlx::query_as::<_, MetadataRecord>(&sql)
                .bind(store_key)
                .bind(owner_id)
                .fetch_optional(&self.db),
        )
        .await
    }

    async fn ensure_metadata(&self, store_key: &str, owner_id: i64) -> RepoResult<bool> {
        let result = bounded(
            self.read_timeout,
            sqlx::query(
                "INSERT INTO file_metadata (store_key, owner_id) VALUES (?, ?)
                 ON CONFLICT(store_key) DO NOTHING",
            )
            .bind(store_key)
            .bind(owner_id)
            .execute(&self.db),
        )
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_metadata(&self, record: &MetadataRecord) -> RepoResult<bool> {
        let result = bounded(
            self.read_timeout,
            sqlx::query(
                "UPDATE file_metadata SET
                    name = ?, primary_phone = ?, primary_email = ?, urls = ?,
                    linkedin = ?, github = ?, full_address = ?, city = ?,
                    postal_code = ?, country = ?, birthday = ?, work_experience = ?
                 WHERE store_key = ? AND owner_id = ?",
            )
            .bind(&record.name)
            .bind(&record.primary_phone)
            .bind(&record.primary_email)
            .bind(&record.urls)
            .bind(&record.linkedin)
            .bind(&record.github)
            .bind(&record.full_address)
            .bind(&record.city)
            .bind(&record.postal_code)
            .bind(&record.country)
            .bind(record.birthday)
            .bind(&record.work_experience)
            .bind(&record.store_key)
            .bind(record.owner_id)
            .execute(&self.db),
        )
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> RepoResult<()> {
        let value = bounded(
            self.read_timeout,
            sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.db),
        )
        .await?;
        debug!(value, "db.ping_ok");
        Ok(())
    }
}
