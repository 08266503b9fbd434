//! Envelope sent to the processing queue after a file is ingested.

use super::file_record::{FileCategory, FileRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a [`FileRecord`]'s scalar fields. Carries no payload bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileNotification {
    pub store_key: String,
    pub owner_id: i64,
    pub category: FileCategory,
    pub original_filename: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub mime_type: Option<String>,
}

impl From<&FileRecord> for FileNotification {
    fn from(record: &FileRecord) -> Self {
        Self {
            store_key: record.store_key.clone(),
            owner_id: record.owner_id,
            category: record.category,
            original_filename: record.original_filename.clone(),
            size_bytes: record.size_bytes,
            uploaded_at: record.uploaded_at,
            content_hash: record.content_hash.clone(),
            mime_type: record.mime_type.clone(),
        }
    }
}

impl FileNotification {
    /// Serialize with keys in sorted order.
    ///
    /// Going through `serde_json::Value` sorts object keys (its map is a
    /// `BTreeMap`), so the same record always yields the same body.
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        let value = serde_json::to_value(self)?;
        serde_json::to_string(&value)
    }
}

/// One delivery of a queue message.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub message_id: String,

    /// Single-use handle for acknowledging this delivery.
    pub receipt_handle: String,

    /// `None` when the body could not be parsed.
    pub payload: Option<FileNotification>,

    /// How many times the message has been handed out, this delivery included.
    pub receive_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonical_json_sorts_keys_and_omits_payload() {
        let notification = FileNotification {
            store_key: "uploads/user-7/20250101120000-ab-cv.pdf".into(),
            owner_id: 7,
            category: FileCategory::Resume,
            original_filename: "cv.pdf".into(),
            size_bytes: 42,
            uploaded_at: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            content_hash: None,
            mime_type: Some("application/pdf".into()),
        };

        let body = notification.to_canonical_json().unwrap();
        let keys: Vec<usize> = [
            "\"category\"",
            "\"content_hash\"",
            "\"mime_type\"",
            "\"original_filename\"",
            "\"owner_id\"",
            "\"size_bytes\"",
            "\"store_key\"",
            "\"uploaded_at\"",
        ]
        .iter()
        .map(|k| body.find(k).unwrap())
        .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "{}", body);
        assert!(!body.contains("bytes\":["));
        assert_eq!(body, notification.to_canonical_json().unwrap());
    }
}
