//! Structured metadata describing the content of an ingested file.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};

/// One entry of a work history.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WorkExperience {
    pub company: Option<String>,
    pub title: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub description: Option<String>,
}

/// Metadata row, one per file record (unique on `store_key`).
///
/// Removed by `ON DELETE CASCADE` when its file record goes away.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, Default, PartialEq)]
pub struct MetadataRecord {
    pub store_key: String,
    pub owner_id: i64,
    pub name: Option<String>,
    pub primary_phone: Option<String>,
    pub primary_email: Option<String>,
    pub urls: Option<String>,
    pub linkedin: Option<String>,
    pub github: Option<String>,
    pub full_address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub work_experience: Option<Json<Vec<WorkExperience>>>,
}

impl MetadataRecord {
    /// An empty record for `store_key`, ready to be filled in by editing flows.
    pub fn shell(store_key: impl Into<String>, owner_id: i64) -> Self {
        Self {
            store_key: store_key.into(),
            owner_id,
            ..Self::default()
        }
    }
}

/// Editable fields of a [`MetadataRecord`], as sent by the edit form.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct MetadataUpdate {
    pub name: Option<String>,
    pub primary_phone: Option<String>,
    pub primary_email: Option<String>,
    pub urls: Option<String>,
    pub linkedin: Option<String>,
    pub github: Option<String>,
    pub full_address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub birthday: Option<NaiveDate>,
    pub work_experience: Option<Vec<WorkExperience>>,
}

impl MetadataUpdate {
    pub fn into_record(self, store_key: impl Into<String>, owner_id: i64) -> MetadataRecord {
        MetadataRecord {
            store_key: store_key.into(),
            owner_id,
            name: self.name,
            primary_phone: self.primary_phone,
            primary_email: self.primary_email,
            urls: self.urls,
            linkedin: self.linkedin,
            github: self.github,
            full_address: self.full_address,
            city: self.city,
            postal_code: self.postal_code,
            country: self.country,
            birthday: self.birthday,
            work_experience: self.work_experience.map(Json),
        }
    }
}
