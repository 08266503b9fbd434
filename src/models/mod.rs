//! Core data models for the file ingestion service.
//!
//! File records and their metadata map to database tables via
//! `sqlx::FromRow`; notifications are the JSON envelopes placed on the
//! processing queue.

pub mod file_record;
pub mod metadata_record;
pub mod notification;
pub mod store_key;
