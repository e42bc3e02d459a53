//! Shared API models

use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
        }
    }
}

/// Process liveness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthzResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub device_id: String,
    pub checkpoint_id: String,
}

/// Result of an operator resend request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResendResponse {
    pub record_id: i64,
    /// False when the record was already pending
    pub requeued: bool,
}
