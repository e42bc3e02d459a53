//! WebAPI - status endpoints
//!
//! ## Responsibilities
//!
//! - Read-only health, dispatcher and storage snapshots for dashboards
//! - Paginated health log
//! - Operator-triggered resend of a detection record

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthzResponse;
use crate::state::AppState;

/// Process liveness
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthzResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        device_id: state.device.device_id.clone(),
        checkpoint_id: state.device.checkpoint_id.clone(),
    })
}
