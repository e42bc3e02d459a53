//! Collaborator probes
//!
//! The capture/inference pipeline and the OCR engine live outside this
//! process (or outside this crate). Health checks and startup gating only see
//! them through these traits. A disabled or unconfigured collaborator is wired
//! to a null implementation so call sites never branch on its presence.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Pipeline readiness as reported by the inference side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReadiness {
    /// Camera opened
    pub initialized: bool,
    /// Frames are flowing
    pub streaming: bool,
    pub models_loaded: bool,
}

impl PipelineReadiness {
    pub const READY: Self = Self {
        initialized: true,
        streaming: true,
        models_loaded: true,
    };

    /// Camera streaming and models loaded
    pub fn is_ready(&self) -> bool {
        self.initialized && self.streaming && self.models_loaded
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Never fails: an unreachable pipeline reads as not ready
    async fn readiness(&self) -> PipelineReadiness;
}

/// Poll `probe` until `predicate` holds or `max_wait` elapses.
/// Returns false on timeout; callers proceed either way.
pub async fn wait_for_readiness<F>(
    probe: &dyn ReadinessProbe,
    predicate: F,
    poll_interval: Duration,
    max_wait: Duration,
) -> bool
where
    F: Fn(&PipelineReadiness) -> bool,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        let state = probe.readiness().await;
        if predicate(&state) {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            tracing::warn!(
                ?state,
                waited_secs = max_wait.as_secs(),
                "Pipeline not ready within bounded wait"
            );
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

// ============================================================
// Null implementation
// ============================================================

/// Used when no readiness source is configured
pub struct AssumeReady;

#[async_trait]
impl ReadinessProbe for AssumeReady {
    async fn readiness(&self) -> PipelineReadiness {
        PipelineReadiness::READY
    }
}

// ============================================================
// In-process flags
// ============================================================

/// Readiness transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessTransition {
    BecameReady,
    LostReadiness,
}

/// Flags flipped by an embedded pipeline; only transitions are logged
#[derive(Default)]
pub struct SharedReadiness {
    state: RwLock<PipelineReadiness>,
}

impl SharedReadiness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn update(&self, next: PipelineReadiness) -> Option<ReadinessTransition> {
        let mut state = self.state.write().await;
        let prev = *state;
        *state = next;

        match (prev.is_ready(), next.is_ready()) {
            (false, true) => {
                tracing::info!(?next, "Pipeline ready");
                Some(ReadinessTransition::BecameReady)
            }
            (true, false) => {
                tracing::warn!(?next, "Pipeline lost readiness");
                Some(ReadinessTransition::LostReadiness)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ReadinessProbe for SharedReadiness {
    async fn readiness(&self) -> PipelineReadiness {
        *self.state.read().await
    }
}

// ============================================================
// HTTP status endpoint
// ============================================================

/// Polls the inference service's status endpoint (`{initialized, streaming, models_loaded}`)
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpReadinessProbe {
    pub fn new(url: Url, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn readiness(&self) -> PipelineReadiness {
        let response = match self.client.get(self.url.clone()).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(status = %r.status(), "Inference status endpoint not ready");
                return PipelineReadiness::default();
            }
            Err(e) => {
                tracing::debug!(error = %e, "Inference status endpoint unreachable");
                return PipelineReadiness::default();
            }
        };
        match response.json::<PipelineReadiness>().await {
            Ok(readiness) => readiness,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed inference status response");
                PipelineReadiness::default()
            }
        }
    }
}

// ============================================================
// OCR engine
// ============================================================

/// OCR engine initialization probe
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Human-readable engine description for check details
    fn describe(&self) -> String;

    async fn initialize(&self) -> crate::Result<()>;
}

/// OCR disabled by feature flag
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    fn describe(&self) -> String {
        "disabled".to_string()
    }

    async fn initialize(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// OCR engine backed by model files in a directory
pub struct ModelDirOcr {
    dir: PathBuf,
}

impl ModelDirOcr {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl OcrEngine for ModelDirOcr {
    fn describe(&self) -> String {
        format!("models in {}", self.dir.display())
    }

    async fn initialize(&self) -> crate::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() && meta.len() > 0 {
                return Ok(());
            }
        }
        Err(crate::Error::NotFound(format!(
            "no OCR model files in {}",
            self.dir.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_readiness_reports_transitions_once() {
        let shared = SharedReadiness::new();
        assert!(!shared.readiness().await.is_ready());

        let partial = PipelineReadiness {
            initialized: true,
            ..Default::default()
        };
        assert_eq!(shared.update(partial).await, None);
        assert_eq!(
            shared.update(PipelineReadiness::READY).await,
            Some(ReadinessTransition::BecameReady)
        );
        assert_eq!(shared.update(PipelineReadiness::READY).await, None);
        assert_eq!(
            shared.update(partial).await,
            Some(ReadinessTransition::LostReadiness)
        );
    }

    #[tokio::test]
    async fn test_wait_for_readiness_is_bounded() {
        let shared = SharedReadiness::new();
        let ready = wait_for_readiness(
            shared.as_ref(),
            PipelineReadiness::is_ready,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await;
        assert!(!ready);

        let flipper = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flipper.update(PipelineReadiness::READY).await;
        });
        let ready = wait_for_readiness(
            shared.as_ref(),
            PipelineReadiness::is_ready,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await;
        assert!(ready);
    }

    #[tokio::test]
    async fn test_model_dir_ocr() {
        let dir = tempfile::tempdir().unwrap();
        let ocr = ModelDirOcr::new(dir.path().to_path_buf());
        assert!(ocr.initialize().await.is_err());

        std::fs::write(dir.path().join("rec.onnx"), b"weights").unwrap();
        assert!(ocr.initialize().await.is_ok());

        let missing = ModelDirOcr::new(dir.path().join("nope"));
        assert!(missing.initialize().await.is_err());
    }
}
