//! Represents an ingested file: the row that points at one stored object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Declared category of an uploaded document.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FileCategory {
    Resume,
    Invoice,
    CoverLetter,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Resume => "resume",
            FileCategory::Invoice => "invoice",
            FileCategory::CoverLetter => "cover_letter",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "resume" | "lebenslauf" => Ok(FileCategory::Resume),
            "invoice" | "rechnung" => Ok(FileCategory::Invoice),
            "cover_letter" | "anschreiben" => Ok(FileCategory::CoverLetter),
            other => Err(format!("unknown file category `{}`", other)),
        }
    }
}

/// A file owned by a user and stored under `store_key` in the object store.
///
/// The row never carries the payload bytes. It exists exactly as long as the
/// object it points at, apart from the windows documented on the ingestion
/// and deletion services.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Object store key; primary key of the row.
    pub store_key: String,

    /// Id of the authenticated principal that uploaded the file.
    pub owner_id: i64,

    /// Declared document category.
    pub category: FileCategory,

    /// Name the client uploaded the file under (before sanitising).
    pub original_filename: String,

    /// Payload length in bytes.
    pub size_bytes: i64,

    /// When the upload was accepted.
    pub uploaded_at: DateTime<Utc>,

    /// Hex SHA-256 digest of the full payload.
    pub content_hash: Option<String>,

    /// MIME type detected from the leading bytes.
    pub mime_type: Option<String>,
}
