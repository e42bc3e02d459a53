//! Collector channels
//!
//! Two transports carry the same envelope:
//!
//! - `websocket`: primary duplex channel, acked per message
//! - `http`: request/response fallback
//!
//! Both sit behind `CollectorChannel`; `ChannelConnector` opens and handshakes
//! them. The connection owner bounds every call with a timeout, so channels
//! never need their own deadlines.

pub mod http;
pub mod websocket;

use super::envelope::Envelope;
use super::types::{CollectorEndpoint, Protocol};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use http::HttpChannel;
pub use websocket::WebSocketChannel;

/// Transport-level failure
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection or handshake failed
    #[error("connect: {0}")]
    Connect(String),
    /// Failed to send a message
    #[error("send: {0}")]
    Send(String),
    /// Failed to receive a message
    #[error("receive: {0}")]
    Receive(String),
    /// Collector answered but refused the message
    #[error("rejected: {0}")]
    Rejected(String),
    /// JSON serialization failed
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Connection closed by the peer
    #[error("connection closed")]
    ConnectionClosed,
    /// Bounded operation expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TransportError> for crate::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => crate::Error::Timeout(format!("collector after {:?}", d)),
            other => crate::Error::Network(other.to_string()),
        }
    }
}

/// An established, handshaken channel to the collector
#[async_trait]
pub trait CollectorChannel: Send {
    fn protocol(&self) -> Protocol;

    /// Deliver one envelope; Ok only once the collector accepted it
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Liveness probe on an idle connection
    async fn ping(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    async fn close(&mut self);
}

/// Opens channels; `registration` is sent as part of the handshake
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect_primary(
        &self,
        registration: &Envelope,
    ) -> Result<Box<dyn CollectorChannel>, TransportError>;

    async fn connect_fallback(
        &self,
        registration: &Envelope,
    ) -> Result<Box<dyn CollectorChannel>, TransportError>;
}

/// Production connector: tokio-tungstenite for the duplex channel, reqwest for the fallback
pub struct NetworkConnector {
    endpoint: CollectorEndpoint,
    http: reqwest::Client,
}

impl NetworkConnector {
    pub fn new(endpoint: CollectorEndpoint, request_timeout: Duration) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .user_agent(concat!("checkpoint-edge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { endpoint, http })
    }

    pub fn into_shared(self) -> Arc<dyn ChannelConnector> {
        Arc::new(self)
    }
}

#[async_trait]
impl ChannelConnector for NetworkConnector {
    async fn connect_primary(
        &self,
        registration: &Envelope,
    ) -> Result<Box<dyn CollectorChannel>, TransportError> {
        let channel = WebSocketChannel::connect(&self.endpoint.ws_url, registration).await?;
        Ok(Box::new(channel))
    }

    async fn connect_fallback(
        &self,
        registration: &Envelope,
    ) -> Result<Box<dyn CollectorChannel>, TransportError> {
        let channel =
            HttpChannel::connect(self.http.clone(), self.endpoint.base_url.clone(), registration)
                .await?;
        Ok(Box::new(channel))
    }
}
