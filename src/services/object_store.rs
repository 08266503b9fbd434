//! src/services/object_store.rs
//!
//! Object store client: bucket-namespaced blob put/get/delete. The local
//! implementation keeps payloads on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}` and records each bucket's
//! region in a marker file, so a bucket created for one region is refused by
//! a client configured for another.

use super::transport::{Retryable, TransportPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("bucket `{bucket}` belongs to region `{actual}`, client is configured for `{expected}`")]
    WrongRegion {
        bucket: String,
        expected: String,
        actual: String,
    },
    #[error("access denied to bucket `{0}`")]
    AccessDenied(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectExists { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout { .. } => true,
            StoreError::Io(err) => !matches!(
                err.kind(),
                ErrorKind::PermissionDenied | ErrorKind::NotFound | ErrorKind::InvalidInput
            ),
            _ => false,
        }
    }

    fn timed_out(operation: &'static str, after: Duration) -> Self {
        StoreError::Timeout { operation, after }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Blob storage addressed by `(container, key)`.
///
/// Every call fails closed: an `Err` means nothing observable was written
/// (for `put`) or the outcome is unknown and must be treated as a failure.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create `container` if missing. Idempotent.
    async fn ensure_container_exists(&self, container: &str) -> StoreResult<()>;

    /// Store `body` under `key`. The container must already exist and `key`
    /// must not; an existing object is never replaced.
    async fn put(&self, container: &str, key: &str, body: Bytes) -> StoreResult<()>;

    async fn get(&self, container: &str, key: &str) -> StoreResult<Bytes>;

    /// Remove `key`. Removing a key that is already gone succeeds.
    async fn delete(&self, container: &str, key: &str) -> StoreResult<()>;
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const REGION_MARKER: &str = ".bucket-region";
const SUPPORTED_REGIONS: [&str; 17] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

/// Filesystem-backed [`ObjectStore`].
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where buckets live.
    base_path: PathBuf,

    /// Region every bucket of this client must belong to.
    region: String,

    policy: TransportPolicy,
}

impl LocalObjectStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        region: &str,
        policy: TransportPolicy,
    ) -> StoreResult<Self> {
        let region = region.to_lowercase();
        ensure_region_valid(&region)?;
        Ok(Self {
            base_path: base_path.into(),
            region,
            policy,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Compute the physical base folder path for a bucket.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Two-level shard directories from MD5(bucket/key), keeping directory
    /// fan-out bounded.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn require_bucket(&self, bucket: &str) -> StoreResult<PathBuf> {
        ensure_bucket_name_safe(bucket)?;
        let root = self.bucket_root(bucket);
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => Ok(root),
            Ok(_) => Err(StoreError::BucketNotFound(bucket.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::BucketNotFound(bucket.to_string()))
            }
            Err(err) => Err(map_access(bucket, err)),
        }
    }

    async fn check_or_create_bucket(&self, bucket: &str) -> StoreResult<()> {
        let root = self.bucket_root(bucket);
        let marker = root.join(REGION_MARKER);

        match fs::read_to_string(&marker).await {
            Ok(actual) => {
                let actual = actual.trim();
                if actual.eq_ignore_ascii_case(&self.region) {
                    debug!(bucket, "store.bucket_exists");
                    return Ok(());
                }
                error!(bucket, expected = %self.region, actual, "store.bucket_wrong_region");
                return Err(StoreError::WrongRegion {
                    bucket: bucket.to_string(),
                    expected: self.region.clone(),
                    actual: actual.to_string(),
                });
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(map_access(bucket, err)),
        }

        info!(bucket, region = %self.region, "store.bucket_missing_creating");
        fs::create_dir_all(&root)
            .await
            .map_err(|err| map_access(bucket, err))?;
        fs::write(&marker, self.region.as_bytes())
            .await
            .map_err(|err| map_access(bucket, err))?;
        info!(bucket, region = %self.region, "store.bucket_created");
        Ok(())
    }

    /// Write to a temp file, fsync, then hard-link it into place so a reader
    /// never observes a partial object and an existing key is left alone.
    async fn write_object(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        body: &Bytes,
    ) -> StoreResult<()> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        if let Err(err) = file.write_all(body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        let linked = fs::hard_link(&tmp_path, file_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(StoreError::ObjectExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let file_path = self.object_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn ensure_container_exists(&self, container: &str) -> StoreResult<()> {
        ensure_bucket_name_safe(container)?;
        self.policy
            .run("store.ensure_bucket", || self.check_or_create_bucket(container))
            .await
    }

    async fn put(&self, container: &str, key: &str, body: Bytes) -> StoreResult<()> {
        ensure_key_safe(key)?;
        self.require_bucket(container).await?;
        let file_path = self.object_path(container, key);

        match self
            .policy
            .run("store.put", || self.write_object(container, key, &file_path, &body))
            .await
        {
            Ok(()) => {
                info!(bucket = container, key, size = body.len(), "store.put_ok");
                Ok(())
            }
            Err(err) => {
                error!(bucket = container, key, "store.put_failed: {}", err);
                Err(err)
            }
        }
    }

    async fn get(&self, container: &str, key: &str) -> StoreResult<Bytes> {
        ensure_key_safe(key)?;
        self.require_bucket(container).await?;
        let file_path = self.object_path(container, key);

        let result = self
            .policy
            .run("store.get", || read_object(container, key, &file_path))
            .await;

        match result {
            Ok(blob) => {
                info!(bucket = container, key, size = blob.len(), "store.get_ok");
                Ok(Bytes::from(blob))
            }
            Err(err @ StoreError::ObjectNotFound { .. }) => {
                error!(bucket = container, key, "store.get_no_such_key");
                Err(err)
            }
            Err(err) => {
                error!(bucket = container, key, "store.get_failed: {}", err);
                Err(err)
            }
        }
    }

    async fn delete(&self, container: &str, key: &str) -> StoreResult<()> {
        ensure_key_safe(key)?;
        self.require_bucket(container).await?;

        match self
            .policy
            .run("store.delete", || self.remove_object(container, key))
            .await
        {
            Ok(()) => {
                info!(bucket = container, key, "store.delete_ok");
                Ok(())
            }
            Err(err) => {
                error!(bucket = container, key, "store.delete_failed: {}", err);
                Err(err)
            }
        }
    }
}

async fn read_object(bucket: &str, key: &str, file_path: &Path) -> StoreResult<Vec<u8>> {
    fs::read(file_path).await.map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            StoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else {
            StoreError::Io(err)
        }
    })
}

fn map_access(bucket: &str, err: io::Error) -> StoreError {
    if err.kind() == ErrorKind::PermissionDenied {
        error!(bucket, "store.bucket_access_denied");
        StoreError::AccessDenied(bucket.to_string())
    } else {
        StoreError::Io(err)
    }
}

/// Rejects keys that are empty, absolute, contain `..`, control characters
/// or backslashes.
fn ensure_key_safe(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StoreError::InvalidObjectKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(StoreError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StoreError::InvalidObjectKey);
    }
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
fn ensure_bucket_name_safe(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

fn ensure_region_valid(region: &str) -> StoreResult<()> {
    if SUPPORTED_REGIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(region))
    {
        Ok(())
    } else {
        Err(StoreError::UnsupportedRegion(region.to_string()))
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, region: &str) -> LocalObjectStore {
        LocalObjectStore::new(dir, region, TransportPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), "eu-central-1");
        let key = "uploads/user-1/20250101000000-00ff-cv.pdf";

        store.ensure_container_exists("resumes").await.unwrap();
        store.ensure_container_exists("resumes").await.unwrap();
        store
            .put("resumes", key, Bytes::from_static(b"%PDF-1.7"))
            .await
            .unwrap();

        let blob = store.get("resumes", key).await.unwrap();
        assert_eq!(&blob[..], b"%PDF-1.7");

        store.delete("resumes", key).await.unwrap();
        assert!(matches!(
            store.get("resumes", key).await,
            Err(StoreError::ObjectNotFound { .. })
        ));
        // deleting twice is fine
        store.delete("resumes", key).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("resumes"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from(REGION_MARKER)]);
    }

    #[tokio::test]
    async fn put_never_replaces_an_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), "local");
        let key = "uploads/user-2/20250101000000-00ff-cv.pdf";

        store.ensure_container_exists("resumes").await.unwrap();
        store
            .put("resumes", key, Bytes::from_static(b"first"))
            .await
            .unwrap();
        let err = store
            .put("resumes", key, Bytes::from_static(b"second"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ObjectExists { .. }));
        assert!(!err.is_transient());
        assert_eq!(&store.get("resumes", key).await.unwrap()[..], b"first");
    }

    #[tokio::test]
    async fn put_without_bucket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), "local");

        let err = store
            .put("missing", "a.pdf", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BucketNotFound(_)));
    }

    #[tokio::test]
    async fn bucket_from_other_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path(), "us-east-1")
            .ensure_container_exists("shared")
            .await
            .unwrap();

        let err = store(dir.path(), "eu-west-1")
            .ensure_container_exists("shared")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongRegion { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unsafe_keys_and_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), "local");

        assert!(matches!(
            store.ensure_container_exists("Bad_Name").await,
            Err(StoreError::InvalidBucketName { .. })
        ));
        assert!(matches!(
            store.ensure_container_exists("192.168.0.1").await,
            Err(StoreError::InvalidBucketName { .. })
        ));

        store.ensure_container_exists("docs").await.unwrap();
        for key in ["", "/etc/passwd", "a/../b", "a\\b"] {
            assert!(matches!(
                store.put("docs", key, Bytes::new()).await,
                Err(StoreError::InvalidObjectKey)
            ));
        }
    }

    #[test]
    fn unknown_region_fails_construction() {
        assert!(matches!(
            LocalObjectStore::new("/tmp", "mars-north-1", TransportPolicy::default()),
            Err(StoreError::UnsupportedRegion(_))
        ));
    }
}
