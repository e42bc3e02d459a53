//! Request/response fallback channel (HTTP)

use super::{CollectorChannel, TransportError};
use crate::dispatcher::envelope::{DataType, Envelope, HTTP_API_PREFIX};
use crate::dispatcher::types::Protocol;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

pub struct HttpChannel {
    client: Client,
    base_url: Url,
}

/// `<base>/api/edge/<endpoint>` regardless of a trailing slash on the base
pub fn endpoint_url(base_url: &Url, data_type: DataType) -> String {
    format!(
        "{}/{}/{}",
        base_url.as_str().trim_end_matches('/'),
        HTTP_API_PREFIX,
        data_type.endpoint()
    )
}

impl HttpChannel {
    /// Connectivity test followed by device registration
    pub async fn connect(
        client: Client,
        base_url: Url,
        registration: &Envelope,
    ) -> Result<Self, TransportError> {
        let channel = Self { client, base_url };
        channel
            .connectivity_test()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        channel
            .post(registration)
            .await
            .map_err(|e| TransportError::Connect(format!("registration: {}", e)))?;
        Ok(channel)
    }

    async fn connectivity_test(&self) -> Result<(), TransportError> {
        let url = endpoint_url(&self.base_url, DataType::Ping);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        check_status(response.status(), &url)
    }

    async fn post(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let url = endpoint_url(&self.base_url, envelope.data_type);
        let response = self
            .client
            .post(&url)
            .json(&envelope.stamped(Protocol::Fallback))
            .send()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        check_status(response.status(), &url)
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        Err(TransportError::Rejected(format!("{} returned {}", url, status)))
    } else {
        Err(TransportError::Send(format!("{} returned {}", url, status)))
    }
}

#[async_trait]
impl CollectorChannel for HttpChannel {
    fn protocol(&self) -> Protocol {
        Protocol::Fallback
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.post(envelope).await
    }

    async fn ping(&mut self, _envelope: &Envelope) -> Result<(), TransportError> {
        self.connectivity_test().await
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_ignores_trailing_slash() {
        let with = Url::parse("http://10.0.0.5:8000/collector/").unwrap();
        let without = Url::parse("http://10.0.0.5:8000/collector").unwrap();
        assert_eq!(
            endpoint_url(&with, DataType::Detection),
            "http://10.0.0.5:8000/collector/api/edge/submit-detection"
        );
        assert_eq!(
            endpoint_url(&without, DataType::Health),
            "http://10.0.0.5:8000/collector/api/edge/submit-health"
        );
        assert_eq!(
            endpoint_url(&without, DataType::Registration),
            "http://10.0.0.5:8000/collector/api/edge/register-device"
        );
    }

    #[test]
    fn test_client_errors_are_rejections() {
        assert!(check_status(StatusCode::OK, "u").is_ok());
        assert!(matches!(
            check_status(StatusCode::UNPROCESSABLE_ENTITY, "u"),
            Err(TransportError::Rejected(_))
        ));
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE, "u"),
            Err(TransportError::Send(_))
        ));
    }

    // ========================================
    // Loopback collector
    // ========================================

    use crate::config::DeviceIdentity;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Collector {
        /// Status for connectivity tests; 0 means 200
        connectivity: Arc<AtomicU16>,
        /// Status for submissions; 0 means 200
        submit: Arc<AtomicU16>,
        received: Arc<Mutex<Vec<Value>>>,
    }

    fn status_of(code: &AtomicU16) -> AxumStatus {
        match code.load(Ordering::SeqCst) {
            0 => AxumStatus::OK,
            n => AxumStatus::from_u16(n).unwrap(),
        }
    }

    async fn connectivity(State(c): State<Collector>) -> AxumStatus {
        status_of(&c.connectivity)
    }

    async fn register(State(c): State<Collector>, Json(body): Json<Value>) -> AxumStatus {
        c.received.lock().unwrap().push(body);
        AxumStatus::OK
    }

    async fn submit(State(c): State<Collector>, Json(body): Json<Value>) -> AxumStatus {
        let status = status_of(&c.submit);
        if status.is_success() {
            c.received.lock().unwrap().push(body);
        }
        status
    }

    async fn serve(collector: Collector) -> Url {
        let app = Router::new()
            .route("/api/edge/connectivity-test", get(connectivity))
            .route("/api/edge/register-device", post(register))
            .route("/api/edge/submit-detection", post(submit))
            .route("/api/edge/submit-health", post(submit))
            .with_state(collector);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "edge-http".into(),
            checkpoint_id: "cp-http".into(),
        }
    }

    fn detection(id: &str) -> Envelope {
        Envelope::new(&device(), DataType::Detection, id.to_string(), serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_submissions_map_status_codes() {
        let collector = Collector::default();
        let base = serve(collector.clone()).await;
        let mut channel = HttpChannel::connect(Client::new(), base, &Envelope::registration(&device()))
            .await
            .unwrap();

        channel.send(&detection("m-ok")).await.unwrap();
        {
            let received = collector.received.lock().unwrap();
            assert_eq!(received.len(), 2);
            assert_eq!(received[0]["data_type"], "registration");
            assert_eq!(received[1]["message_id"], "m-ok");
            assert_eq!(received[1]["protocol"], "fallback");
        }

        collector.submit.store(422, Ordering::SeqCst);
        assert!(matches!(
            channel.send(&detection("m-bad")).await,
            Err(TransportError::Rejected(_))
        ));

        collector.submit.store(503, Ordering::SeqCst);
        assert!(matches!(
            channel.send(&detection("m-later")).await,
            Err(TransportError::Send(_))
        ));

        collector.submit.store(0, Ordering::SeqCst);
        channel.send(&detection("m-later")).await.unwrap();
        assert_eq!(collector.received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_connectivity_test_blocks_connect() {
        let collector = Collector::default();
        collector.connectivity.store(503, Ordering::SeqCst);
        let base = serve(collector.clone()).await;

        let result = HttpChannel::connect(Client::new(), base, &Envelope::registration(&device())).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(collector.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ping_uses_connectivity_test() {
        let collector = Collector::default();
        let base = serve(collector.clone()).await;
        let mut channel = HttpChannel::connect(Client::new(), base, &Envelope::registration(&device()))
            .await
            .unwrap();

        channel.ping(&Envelope::ping(&device())).await.unwrap();
        collector.connectivity.store(500, Ordering::SeqCst);
        assert!(channel.ping(&Envelope::ping(&device())).await.is_err());
    }
}
