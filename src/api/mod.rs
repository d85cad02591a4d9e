//! HTTP API: transfer initiation, node callbacks, status queries and health

use crate::config::ApiConfig;
use crate::coordination::{CallbackResult, TransferCoordinator, TransferRequest, TransferService};
use crate::error::{TransferError, TransferResult};
use crate::state::{TransferState, TransferStats, TransferStatus};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TransferCoordinator>,
    pub service: Arc<TransferService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/api/transfer", post(create_transfer))
        .route("/api/transfer/:request_id", get(get_transfer))
        .route("/api/callback", post(handle_callback))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> TransferResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TransferError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TransferError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the status store
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.coordinator.store().health_check().await.is_ok();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: database,
            database,
        }),
    )
}

/// Row counts by status plus the number of waiting callers
async fn get_stats(State(state): State<AppState>) -> TransferResult<Json<StatsResponse>> {
    let transfers = state.coordinator.store().stats().await?;
    let waiting = state.coordinator.registry().len().await;
    Ok(Json(StatsResponse {
        transfers,
        waiting,
    }))
}

/// Execute a transfer and hold the request until the block callback or the deadline
async fn create_transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> TransferResult<impl IntoResponse> {
    let receipt = state.service.execute(request).await?;
    let status = match receipt.status {
        TransferState::Timeout => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(receipt)))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> TransferResult<Json<TransferStatus>> {
    let status = state.coordinator.store().get_by_request_id(&request_id).await?;
    Ok(Json(status))
}

/// Block finalization callback from the node
async fn handle_callback(
    State(state): State<AppState>,
    Json(result): Json<CallbackResult>,
) -> TransferResult<Json<CallbackResponse>> {
    if result.block_id.trim().is_empty() {
        return Err(TransferError::InvalidRequest("block_id is required".to_string()));
    }

    let block_id = result.block_id.clone();
    let disposition = state.coordinator.on_callback(&block_id, result).await;

    Ok(Json(CallbackResponse {
        delivered: disposition.delivered(),
        request_id: disposition.request_id().map(str::to_string),
    }))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    transfers: TransferStats,
    waiting: usize,
}

#[derive(Serialize)]
struct CallbackResponse {
    delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}
