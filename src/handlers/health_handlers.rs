//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks disk I/O under the storage root

use crate::services::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Always returns 200 OK and never touches the disk.
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
/// Writes, reads back and deletes a probe file in the storage root.
/// HTTP 200 when the probe passes, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let probe = state
        .layout()
        .root_storage_path()
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&probe, b"readyz").await {
        Ok(_) => match fs::read(&probe).await {
            Ok(bytes) if bytes == b"readyz" => match fs::remove_file(&probe).await {
                Ok(_) => (true, None::<String>),
                Err(e) => (true, Some(format!("could not remove probe file: {}", e))),
            },
            Ok(_) => {
                let _ = fs::remove_file(&probe).await;
                (false, Some("probe file content mismatch".to_string()))
            }
            Err(e) => {
                let _ = fs::remove_file(&probe).await;
                (false, Some(format!("could not read probe file: {}", e)))
            }
        },
        Err(e) => (false, Some(format!("could not write probe file: {}", e))),
    };

    let disk_ok = disk_check.0;
    if let Some(reason) = &disk_check.1 {
        tracing::warn!("readiness disk probe: {}", reason);
    }
    let mut checks = HashMap::new();
    checks.insert(
        "disk",
        CheckStatus {
            ok: disk_ok,
            error: disk_check.1,
        },
    );

    let body = ReadyResponse {
        status: if disk_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if disk_ok {
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
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
