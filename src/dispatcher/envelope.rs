//! Wire envelope
//!
//! Every outbound message, on either channel, is the same envelope:
//!
//! ```json
//! {
//!   "message_id": "…", "timestamp": "2026-01-02T03:04:05.678Z",
//!   "protocol": "primary", "device_id": "edge-001",
//!   "data_type": "detection", "payload": {…}, "metadata": {…}
//! }
//! ```
//!
//! On the duplex channel it travels inside `{"event": "detection-data", "data": <envelope>}`
//! and is acknowledged by `{"event": "detection-data-ack", "data": {"message_id": …}}`.
//! The collector deduplicates by `message_id`, which is stable across retries.

use super::types::Protocol;
use crate::config::DeviceIdentity;
use crate::record_store::{DetectionRecord, HealthCheckLogEntry};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Payload kind carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Registration,
    Detection,
    Health,
    Ping,
}

impl DataType {
    /// Outbound event name on the duplex channel
    pub fn event(&self) -> &'static str {
        match self {
            Self::Registration => "device-registration",
            Self::Detection => "detection-data",
            Self::Health => "health-status",
            Self::Ping => "liveness-ping",
        }
    }

    /// Endpoint path segment on the request/response channel
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Registration => "register-device",
            Self::Detection => "submit-detection",
            Self::Health => "submit-health",
            Self::Ping => "connectivity-test",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Detection => "detection",
            Self::Health => "health",
            Self::Ping => "ping",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prefix shared by the request/response endpoints
pub const HTTP_API_PREFIX: &str = "api/edge";

/// Event name the collector uses to reject a message
pub const ERROR_EVENT: &str = "error";

/// ISO-8601 with timezone, millisecond precision
pub fn wire_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Stable id for one stored item; every retry reuses it
pub fn stable_message_id(device_id: &str, data_type: DataType, record_id: i64) -> String {
    let name = format!("edge://{}/{}/{}", device_id, data_type.as_str(), record_id);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub timestamp: String,
    pub protocol: Protocol,
    pub device_id: String,
    pub data_type: DataType,
    pub payload: Value,
    pub metadata: Value,
}

impl Envelope {
    pub fn new(
        device: &DeviceIdentity,
        data_type: DataType,
        message_id: String,
        payload: Value,
    ) -> Self {
        Self {
            message_id,
            timestamp: wire_timestamp(),
            protocol: Protocol::Unset,
            device_id: device.device_id.clone(),
            data_type,
            payload,
            metadata: serde_json::json!({ "checkpoint_id": device.checkpoint_id }),
        }
    }

    pub fn detection(device: &DeviceIdentity, record: &DetectionRecord) -> Self {
        Self::new(
            device,
            DataType::Detection,
            stable_message_id(&device.device_id, DataType::Detection, record.id),
            record.payload(),
        )
    }

    pub fn health(device: &DeviceIdentity, entry: &HealthCheckLogEntry) -> Self {
        Self::new(
            device,
            DataType::Health,
            stable_message_id(&device.device_id, DataType::Health, entry.id),
            entry.payload(),
        )
    }

    pub fn registration(device: &DeviceIdentity) -> Self {
        Self::new(
            device,
            DataType::Registration,
            Uuid::new_v4().to_string(),
            serde_json::json!({
                "device_id": device.device_id,
                "checkpoint_id": device.checkpoint_id,
                "software_version": env!("CARGO_PKG_VERSION"),
                "capabilities": ["detection", "health"],
            }),
        )
    }

    pub fn ping(device: &DeviceIdentity) -> Self {
        Self::new(
            device,
            DataType::Ping,
            Uuid::new_v4().to_string(),
            Value::Object(Default::default()),
        )
    }

    /// Attach delivery metadata
    pub fn with_delivery(mut self, attempt: u32, replay: bool) -> Self {
        if let Value::Object(map) = &mut self.metadata {
            map.insert("attempt".to_string(), Value::from(attempt));
            map.insert("replay".to_string(), Value::Bool(replay));
        }
        self
    }

    /// Copy stamped with the channel that carries it
    pub fn stamped(&self, protocol: Protocol) -> Self {
        let mut envelope = self.clone();
        envelope.protocol = protocol;
        envelope
    }
}

// ============================================================
// Duplex channel frames
// ============================================================

/// `{"event": …, "data": …}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn outbound(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: envelope.data_type.event().to_string(),
            data: serde_json::to_value(envelope)?,
        })
    }
}

/// Ack event name for an outbound event
pub fn ack_event(event: &str) -> String {
    format!("{}-ack", event)
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack {
        event: String,
        message_id: Option<String>,
    },
    Error {
        message_id: Option<String>,
        message: String,
    },
    Other(String),
}

impl Inbound {
    /// Whether this frame settles the outbound message `envelope`.
    /// Acks/errors without a message id are taken to refer to the in-flight message.
    pub fn settles(&self, envelope: &Envelope) -> bool {
        let matches_id =
            |id: &Option<String>| id.as_deref().map_or(true, |id| id == envelope.message_id);
        match self {
            Self::Ack { event, message_id } => {
                *event == ack_event(envelope.data_type.event()) && matches_id(message_id)
            }
            Self::Error { message_id, .. } => matches_id(message_id),
            Self::Other(_) => false,
        }
    }
}

pub fn parse_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let frame: Frame = serde_json::from_str(text)?;
    let message_id = frame
        .data
        .get("message_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if frame.event == ERROR_EVENT {
        let message = frame
            .data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("rejected")
            .to_string();
        return Ok(Inbound::Error {
            message_id,
            message,
        });
    }
    if frame.event.ends_with("-ack") {
        return Ok(Inbound::Ack {
            event: frame.event,
            message_id,
        });
    }
    Ok(Inbound::Other(frame.event))
}
