pub mod file_handlers;
pub mod health_handlers;
pub mod metadata_handlers;

use crate::{
    errors::AppError,
    services::{
        consistency::ConsistencyMonitor, deletion_service::DeletionService,
        ingestion_service::IngestionService, metadata_repository::FileRepository,
        object_store::ObjectStore, queue_client::NotificationQueue,
    },
};
use axum::{extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

/// Header carrying the user id established by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state handed to every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: IngestionService,
    pub deletion: DeletionService,
    pub repository: Arc<dyn FileRepository>,
    pub store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn NotificationQueue>,
    pub monitor: Arc<ConsistencyMonitor>,
    pub bucket: String,
}

/// The authenticated user a request acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal(pub i64);

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(Principal)
            .ok_or_else(|| AppError::unauthorized("Authentication required."))
    }
}
