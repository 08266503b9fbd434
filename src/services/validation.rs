//! Upload validation, run before anything touches a durable store.
//!
//! Checks run in a fixed order and stop at the first failure:
//! size, extension, declared content type, then (when enabled) the MIME
//! type sniffed from the leading bytes. The SHA-256 content hash is computed
//! for every accepted file whether or not sniffing is enabled.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// How many leading bytes the sniffer looks at.
pub const SNIFF_LEN: usize = 1024;

#[derive(Clone, Debug)]
pub struct ValidationPolicy {
    /// Size limit in KiB, compared against `len / 1024`.
    pub max_size_kb: u64,
    /// Lower-case extensions without the dot.
    pub allowed_extensions: Vec<String>,
    /// Substring the declared content type must contain, e.g. `pdf`.
    pub expected_subtype: String,
    pub content_sniff: bool,
    pub allowed_mime_types: Vec<String>,
}

impl ValidationPolicy {
    pub fn new(
        max_size_kb: u64,
        allowed_extensions: impl IntoIterator<Item = impl AsRef<str>>,
        expected_subtype: &str,
    ) -> Self {
        Self {
            max_size_kb,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            expected_subtype: expected_subtype.to_ascii_lowercase(),
            content_sniff: true,
            allowed_mime_types: vec!["application/pdf".to_string()],
        }
    }

    pub fn with_content_sniff(mut self, enabled: bool, allowed_mime_types: Vec<String>) -> Self {
        self.content_sniff = enabled;
        self.allowed_mime_types = allowed_mime_types;
        self
    }
}

/// A file as received from the client.
#[derive(Clone, Debug)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// A file that passed every check.
#[derive(Clone, Debug)]
pub struct ValidatedFile {
    pub filename: String,
    pub bytes: Bytes,
    pub content_hash: String,
    pub sniffed_mime: Option<String>,
}

/// Why an upload was rejected. Each message is safe to show to the user.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("File size exceeded {limit_kb} KB.")]
    TooLarge { size_kb: u64, limit_kb: u64 },
    #[error("File name is missing.")]
    MissingName,
    #[error("File name has no extension. Allowed: {allowed}")]
    MissingExtension { allowed: String },
    #[error("Unsupported file extension. Allowed: {allowed}")]
    UnsupportedExtension { extension: String, allowed: String },
    #[error("Unsupported file type. Only {expected} is allowed.")]
    UnsupportedContentType {
        declared: Option<String>,
        expected: String,
    },
    #[error("File content does not match an allowed type (detected {detected}).")]
    ContentMismatch { detected: String },
}

pub fn validate(
    upload: FileUpload,
    policy: &ValidationPolicy,
) -> Result<ValidatedFile, ValidationFailure> {
    check_size(upload.bytes.len(), policy.max_size_kb)?;
    check_extension(&upload.filename, &policy.allowed_extensions)?;
    check_declared_type(upload.content_type.as_deref(), &policy.expected_subtype)?;

    let sniffed_mime = if policy.content_sniff {
        let head = &upload.bytes[..upload.bytes.len().min(SNIFF_LEN)];
        let detected = sniff_mime(head);
        if !policy
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(detected))
        {
            return Err(ValidationFailure::ContentMismatch {
                detected: detected.to_string(),
            });
        }
        Some(detected.to_string())
    } else {
        None
    };

    Ok(ValidatedFile {
        content_hash: content_hash(&upload.bytes),
        filename: upload.filename,
        bytes: upload.bytes,
        sniffed_mime,
    })
}

fn check_size(len: usize, limit_kb: u64) -> Result<(), ValidationFailure> {
    let size_kb = len as u64 / 1024;
    if size_kb > limit_kb {
        return Err(ValidationFailure::TooLarge { size_kb, limit_kb });
    }
    Ok(())
}

fn check_extension(filename: &str, allowed: &[String]) -> Result<(), ValidationFailure> {
    let allowed_list = || allowed.join(", ");
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, extension) = base
        .rsplit_once('.')
        .filter(|(_, ext)| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .ok_or_else(|| ValidationFailure::MissingExtension {
            allowed: allowed_list(),
        })?;
    // `.pdf` is an extension with nothing to name
    if stem.trim_matches('.').trim().is_empty() {
        return Err(ValidationFailure::MissingName);
    }
    let extension = extension.to_ascii_lowercase();

    if allowed.iter().any(|candidate| *candidate == extension) {
        Ok(())
    } else {
        Err(ValidationFailure::UnsupportedExtension {
            extension,
            allowed: allowed_list(),
        })
    }
}

fn check_declared_type(declared: Option<&str>, expected: &str) -> Result<(), ValidationFailure> {
    match declared {
        Some(value) if value.to_ascii_lowercase().contains(expected) => Ok(()),
        other => Err(ValidationFailure::UnsupportedContentType {
            declared: other.map(str::to_string),
            expected: expected.to_ascii_uppercase(),
        }),
    }
}

/// Hex SHA-256 of the full payload.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"PK\x03\x04", "application/zip"),
    (b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1", "application/x-ole-storage"),
    (b"{\\rtf", "text/rtf"),
    (b"\x7fELF", "application/x-executable"),
    (b"MZ", "application/x-dosexec"),
];

/// Detect a MIME type from the leading bytes of a file, ignoring its name.
pub fn sniff_mime(head: &[u8]) -> &'static str {
    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return *mime;
    }
    if head.is_empty() {
        return "application/x-empty";
    }
    if looks_like_text(head) {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

/// UTF-8 without NULs; a multi-byte sequence cut off by the sniff window
/// still counts as text.
fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(err) => err.error_len().is_none(),
    }
}
