//! Tracking of states where the object store and the metadata database have
//! drifted apart and only a reconciliation sweep can repair them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

#[derive(Debug, Default)]
pub struct ConsistencyMonitor {
    orphaned_objects: AtomicU64,
    dangling_records: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ConsistencySnapshot {
    /// Objects left in the store without a file record.
    pub orphaned_objects: u64,
    /// File records whose object was already deleted.
    pub dangling_records: u64,
}

impl ConsistencyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An ingestion failed and deleting the uploaded object failed too.
    pub fn orphaned_object(&self, store_key: &str, owner_id: i64, cause: &str, compensation: &str) {
        self.orphaned_objects.fetch_add(1, Ordering::Relaxed);
        error!(
            severity = "critical",
            store_key,
            owner_id,
            cause,
            compensation,
            "consistency.orphaned_object: compensation failed, object has no file record"
        );
    }

    /// The object was deleted but its file record could not be.
    pub fn dangling_record(&self, store_key: &str, owner_id: i64, cause: &str) {
        self.dangling_records.fetch_add(1, Ordering::Relaxed);
        error!(
            severity = "critical",
            store_key,
            owner_id,
            cause,
            "consistency.dangling_record: object deleted, file record remains"
        );
    }

    pub fn snapshot(&self) -> ConsistencySnapshot {
        ConsistencySnapshot {
            orphaned_objects: self.orphaned_objects.load(Ordering::Relaxed),
            dangling_records: self.dangling_records.load(Ordering::Relaxed),
        }
    }
}
