//! API Routes

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::{ApiResponse, ResendResponse};
use crate::record_store::{parse_ts, CheckStatus, LogFilter, MAX_PAGE_LIMIT};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(super::healthz))
        // Health Monitor
        .route("/api/health", get(get_health))
        .route("/api/health/logs", get(list_health_logs))
        // Dispatcher
        .route("/api/dispatcher/status", get(get_dispatcher_status))
        .route("/api/detections/:id/resend", post(resend_detection))
        // Storage
        .route("/api/storage/status", get(get_storage_status))
        .with_state(state)
}

// ========================================
// Health
// ========================================

async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.health.snapshot().await))
}

#[derive(Deserialize)]
struct HealthLogQuery {
    component: Option<String>,
    status: Option<String>,
    since: Option<String>, // ISO8601
    until: Option<String>, // ISO8601
    limit: Option<u32>,
    page: Option<u32>,
}

fn parse_bound(name: &str, raw: Option<String>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .ok_or_else(|| Error::Validation(format!("{}: invalid timestamp '{}'", name, raw))),
    }
}

async fn list_health_logs(
    State(state): State<AppState>,
    Query(query): Query<HealthLogQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(50);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(Error::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_LIMIT
        )));
    }

    let status = query
        .status
        .map(|raw| raw.parse::<CheckStatus>())
        .transpose()
        .map_err(Error::Validation)?;

    let filter = LogFilter {
        component: query.component,
        status,
        since: parse_bound("since", query.since)?,
        until: parse_bound("until", query.until)?,
    };
    let page = state
        .health
        .get_logs(&filter, limit, query.page.unwrap_or(1))
        .await?;

    Ok(Json(ApiResponse::success(json!({
        "items": page.items,
        "total": page.total,
        "page": page.page,
        "limit": page.limit,
        "total_pages": page.total_pages(),
    }))))
}

// ========================================
// Dispatcher
// ========================================

async fn get_dispatcher_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.dispatcher.status().await))
}

/// Clear the sent flag so the detection sender delivers the record again
async fn resend_detection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    if state.store.get_detection(id).await?.is_none() {
        return Err(Error::NotFound(format!("detection record {}", id)));
    }
    let requeued = state.store.reset_sent(id).await?;

    tracing::info!(record_id = id, requeued = requeued, "Operator requested resend");
    Ok(Json(ApiResponse::success(ResendResponse {
        record_id: id,
        requeued,
    })))
}

// ========================================
// Storage
// ========================================

async fn get_storage_status(State(state): State<AppState>) -> impl IntoResponse {
    match &state.storage {
        Some(storage) => Json(ApiResponse::success(json!({
            "enabled": true,
            "status": storage.status().await,
            "last_cleanup": storage.last_summary().await,
        }))),
        None => Json(ApiResponse::success(json!({ "enabled": false }))),
    }
}
