//! Checkpoint Edge - node services
//!
//! Composition root: builds every component from the validated configuration
//! and hands them to the startup coordinator.

use checkpoint_edge::{
    config::AppConfig,
    dispatcher::Dispatcher,
    health_monitor::{standard_checks, CheckDeps, HealthMonitor},
    readiness::{AssumeReady, DisabledOcr, HttpReadinessProbe, ModelDirOcr, OcrEngine, ReadinessProbe},
    record_store::RecordStore,
    startup::{start_services, Services, StartupOptions},
    state::AppState,
    storage_monitor::{SpaceProbe, StorageMonitor, SysinfoSpaceProbe},
    web_api,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const READINESS_HTTP_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "checkpoint_edge=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Checkpoint Edge v{}", env!("CARGO_PKG_VERSION"));
    let started_at = Instant::now();

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!(
        device_id = %config.device.device_id,
        checkpoint_id = %config.device.checkpoint_id,
        offline = config.is_offline(),
        "Configuration loaded"
    );

    // Record store
    let store = RecordStore::open(&config.database_url).await?;
    tracing::info!("Record store opened");

    // Optional collaborators
    let readiness: Arc<dyn ReadinessProbe> = match &config.inference_status_url {
        Some(url) => Arc::new(HttpReadinessProbe::new(url.clone(), READINESS_HTTP_TIMEOUT)?),
        None => {
            tracing::warn!("INFERENCE_STATUS_URL not set, assuming pipeline is ready");
            Arc::new(AssumeReady)
        }
    };
    let ocr: Arc<dyn OcrEngine> = match (&config.ocr_model_dir, config.features.ocr_check) {
        (Some(dir), true) => Arc::new(ModelDirOcr::new(dir.clone())),
        _ => Arc::new(DisabledOcr),
    };
    let space: Arc<dyn SpaceProbe> = Arc::new(SysinfoSpaceProbe);

    // Health Monitor
    let checks = standard_checks(
        &config.health,
        CheckDeps {
            store: store.clone(),
            readiness: readiness.clone(),
            ocr,
            space: space.clone(),
            capture_dir: config.storage.capture_dir.clone(),
            min_free_bytes: config.storage.min_free_bytes(),
            collector: config
                .dispatcher
                .collector
                .as_ref()
                .map(|c| c.base_url.clone()),
        },
    );
    let health = Arc::new(HealthMonitor::new(
        config.health.clone(),
        store.clone(),
        readiness.clone(),
        checks,
    ));

    // Communication Dispatcher
    let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone(), store.clone())?);

    // Storage Monitor
    let storage = if config.features.storage_monitor {
        Some(Arc::new(StorageMonitor::new(
            config.storage.clone(),
            store.clone(),
            space,
        )))
    } else {
        tracing::info!("Storage monitor disabled");
        None
    };

    let running = start_services(
        Services {
            readiness,
            health: health.clone(),
            dispatcher: dispatcher.clone(),
            storage: storage.clone(),
        },
        StartupOptions {
            pipeline_wait: config.startup_wait,
            poll_interval: config.health.readiness_poll_interval,
        },
    )
    .await?;

    // Status API
    let server = if config.features.status_api {
        let state = AppState {
            device: config.device.clone(),
            store: store.clone(),
            health,
            dispatcher,
            storage,
            started_at,
        };
        let app = web_api::create_router(state)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http());

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Status API listening on {}", addr);

        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Status API server stopped");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(server) = server {
        server.abort();
    }
    running.shutdown().await;
    store.close().await;

    tracing::info!("Checkpoint Edge stopped");
    Ok(())
}
