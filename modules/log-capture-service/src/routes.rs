//! Axum route handlers for the log capture RPC API.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use log_capture_service::discovery::executable_count;
use log_capture_service::{CaptureError, Convention, DiscoveryRetriever, FileChangeBridge, IngestionEngine};
use log_capture_types::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_WAIT_SECS: u64 = 30;
const MAX_WAIT_SECS: u64 = 300;

pub struct AppState {
    pub engine: Option<IngestionEngine>,
    pub discovery: DiscoveryRetriever,
    pub convention: Convention,
    pub start_time: Instant,
}

// =====================================================
// Service Endpoints
// =====================================================

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let capture = match &state.engine {
        Some(engine) => Some(engine.status().await),
        None => None,
    };
    let apps = state.discovery.latest();

    let status = ServiceStatus {
        running: true,
        uptime_secs: state.start_time.elapsed().as_secs(),
        capture,
        discovered_apps: apps.len(),
        discovered_executables: executable_count(&apps),
    };

    (StatusCode::OK, Json(RpcResponse::ok(status)))
}

// POST /rpc/export
//
// Responds with the export document itself: pretty-printed with sorted keys.
pub async fn export(State(state): State<Arc<AppState>>) -> Response {
    let Some(engine) = &state.engine else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RpcResponse::<()>::err("Capture is not enabled in this process")),
        )
            .into_response();
    };

    match engine.export() {
        Ok(document) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            document,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::<()>::err(format!("Export failed: {}", e))),
        )
            .into_response(),
    }
}

// =====================================================
// Discovery Endpoints
// =====================================================

// GET /rpc/apps
pub async fn apps(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<AppContainer>>>) {
    (StatusCode::OK, Json(RpcResponse::ok(state.discovery.latest())))
}

// POST /rpc/executables/wait_change
pub async fn wait_change(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WaitChangeRequest>,
) -> (StatusCode, Json<RpcResponse<WaitChangeResponse>>) {
    let path = match state.convention.log_store_path(&req.executable_id) {
        Ok(p) => p,
        Err(e @ CaptureError::InvalidId(_)) => {
            return (StatusCode::BAD_REQUEST, Json(RpcResponse::err(e.to_string())))
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(e.to_string())),
            )
        }
    };

    if !path.is_file() {
        return (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err(format!(
                "No log store for {}",
                req.executable_id
            ))),
        );
    }

    let bridge = match FileChangeBridge::new(&path) {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(format!("Failed to observe store: {}", e))),
            )
        }
    };

    let timeout = Duration::from_secs(
        req.timeout_secs
            .unwrap_or(DEFAULT_WAIT_SECS)
            .clamp(1, MAX_WAIT_SECS),
    );
    log::debug!(
        "[FILE_WATCH] Waiting up to {}s for changes to {}",
        timeout.as_secs(),
        bridge.path().display()
    );
    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let result = bridge.next(&cancel).await;
    timer.abort();

    match result {
        Ok(event) => (
            StatusCode::OK,
            Json(RpcResponse::ok(WaitChangeResponse {
                executable_id: req.executable_id,
                changed: event.is_some(),
            })),
        ),
        Err(e @ CaptureError::WaiterPending(_)) => {
            (StatusCode::CONFLICT, Json(RpcResponse::err(e.to_string())))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Wait failed: {}", e))),
        ),
    }
}
