//! Primary duplex channel (WebSocket)
//!
//! Each outbound frame waits for its `<event>-ack` (or an `error` frame for the
//! same message) before the send counts as delivered. Unrelated inbound frames
//! are skipped so the connection stays usable.

use super::{CollectorChannel, TransportError};
use crate::dispatcher::envelope::{parse_inbound, Envelope, Frame, Inbound};
use crate::dispatcher::types::Protocol;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WebSocketChannel {
    stream: WsStream,
}

impl WebSocketChannel {
    /// Open the socket and register the device
    pub async fn connect(url: &Url, registration: &Envelope) -> Result<Self, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut channel = Self { stream };
        channel
            .exchange(registration)
            .await
            .map_err(|e| TransportError::Connect(format!("registration: {}", e)))?;

        tracing::debug!(url = %url, "Duplex channel registered");
        Ok(channel)
    }

    /// Send one frame and wait until the collector settles it
    async fn exchange(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let stamped = envelope.stamped(Protocol::Primary);
        let json = serde_json::to_string(&Frame::outbound(&stamped)?)?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        loop {
            match self.stream.next().await {
                None => return Err(TransportError::ConnectionClosed),
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                Some(Ok(Message::Text(text))) => match parse_inbound(&text) {
                    Ok(inbound) if inbound.settles(&stamped) => {
                        return match inbound {
                            Inbound::Error { message, .. } => Err(TransportError::Rejected(message)),
                            _ => Ok(()),
                        };
                    }
                    Ok(other) => {
                        tracing::trace!(frame = ?other, "Skipping unrelated frame");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping malformed frame");
                    }
                },
                Some(Ok(Message::Close(_))) => return Err(TransportError::ConnectionClosed),
                // ping/pong/binary frames
                Some(Ok(_)) => {}
            }
        }
    }
}

#[async_trait]
impl CollectorChannel for WebSocketChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Primary
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.exchange(envelope).await
    }

    async fn ping(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.exchange(envelope).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Duplex channel close failed");
        }
    }
}
