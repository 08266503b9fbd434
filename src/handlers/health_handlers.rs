//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness of the database, object store and queue,
//!   plus the count of detected store/database inconsistencies

use super::AppState;
use crate::services::consistency::ConsistencySnapshot;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// HTTP 200 when every backend answers, 503 otherwise. Inconsistencies do
/// not fail readiness; they need a reconciliation sweep, not a restart.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.repository.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e),
    };

    let store = match state.store.ensure_container_exists(&state.bucket).await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e),
    };

    let queue = match state.queue.depth().await {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e),
    };

    let overall_ok = database.ok && store.ok && queue.ok;

    let mut checks = HashMap::new();
    checks.insert("database", database);
    checks.insert("object_store", store);
    checks.insert("queue", queue);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
        consistency: state.monitor.snapshot(),
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
    consistency: ConsistencySnapshot,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(err: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            error: Some(format!("error: {}", err)),
        }
    }
}
