//! Object store keys of the form
//! `uploads/user-<owner>/<YYYYMMDDHHMMSS>-<hex>-<filename>`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fmt;
use uuid::Uuid;

const KEY_ROOT: &str = "uploads/user-";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_LEN: usize = 14;
const SUFFIX_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKey {
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub suffix: String,
    pub filename: String,
}

impl StoreKey {
    /// Build a fresh key for `filename` uploaded by `owner_id` at `now`.
    ///
    /// The random suffix is a full v4 UUID in simple hex form.
    pub fn generate(owner_id: i64, filename: &str, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            created_at: now,
            suffix: Uuid::new_v4().simple().to_string(),
            filename: sanitize_filename(filename),
        }
    }

    /// Parse a key produced by [`StoreKey::generate`].
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(KEY_ROOT)?;
        let (owner, name) = rest.split_once('/')?;
        let owner_id = owner.parse::<i64>().ok()?;

        let (stamp, rest) = name.split_at_checked(TIMESTAMP_LEN)?;
        let rest = rest.strip_prefix('-')?;
        let (suffix, rest) = rest.split_at_checked(SUFFIX_LEN)?;
        let filename = rest.strip_prefix('-')?;
        if !suffix.bytes().all(|b| b.is_ascii_hexdigit()) || filename.is_empty() {
            return None;
        }

        let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            owner_id,
            created_at: Utc.from_utc_datetime(&naive),
            suffix: suffix.to_string(),
            filename: filename.to_string(),
        })
    }

    /// Prefix shared by every key of one owner.
    pub fn owner_prefix(owner_id: i64) -> String {
        format!("{}{}/", KEY_ROOT, owner_id)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}-{}-{}",
            KEY_ROOT,
            self.owner_id,
            self.created_at.format(TIMESTAMP_FORMAT),
            self.suffix,
            self.filename
        )
    }
}

/// Strip directory components and anything outside `[A-Za-z0-9._-]`.
///
/// Falls back to `upload` when nothing usable remains.
pub fn sanitize_filename(original: &str) -> String {
    let base = original.rsplit(['/', '\\']).next().unwrap_or(original);
    let mut cleaned = String::with_capacity(base.len());
    for c in base.chars() {
        if !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            continue;
        }
        // `..` never reaches the store
        if c == '.' && cleaned.ends_with('.') {
            continue;
        }
        cleaned.push(c);
    }
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
