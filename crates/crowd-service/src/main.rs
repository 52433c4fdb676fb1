use anyhow::Result;
use common::runs::RunStartRequest;
use crowd_engine::Thresholds;
use crowd_service::detector::{OnnxDetectorConfig, OnnxPersonDetector, PersonDetector};
use crowd_service::render::FrameRenderer;
use crowd_service::store::{LogStore, MemoryLogStore, SqliteLogStore};
use crowd_service::{api, ServiceConfig, ServiceState};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = telemetry::init_with_service("crowd-service");

    info!("Starting crowd service...");

    let config = ServiceConfig::from_env()?;
    info!(
        bind = %config.bind_addr,
        skip_rate = config.skip_rate,
        crowd_threshold = config.crowd_threshold,
        surge_limit = config.surge_limit,
        "crowd service configuration"
    );

    let store: Arc<dyn LogStore> = match &config.database_url {
        Some(url) => Arc::new(SqliteLogStore::connect(url).await?),
        None => {
            info!("No database configured, keeping the crowd log in memory");
            Arc::new(MemoryLogStore::new())
        }
    };

    let detector = load_detector(&config);

    let state = ServiceState::new(
        config.engine_config(),
        FrameRenderer::new(config.output_width, config.output_height, config.jpeg_quality),
        Thresholds::new(config.crowd_threshold, config.surge_limit),
        store,
        detector,
    );

    if !state.has_detector() && config.detections.is_none() {
        warn!("No person detector available until a run supplies detections");
    }

    if let Some(source) = config.source.clone() {
        let request = RunStartRequest {
            source,
            detections: config.detections.clone(),
            skip_rate: None,
        };
        if let Err(e) = state.start_run(request).await {
            error!(error = %e, "failed to start the configured source");
        }
    }

    let app = api::router(state.clone());

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Crowd service listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

fn load_detector(config: &ServiceConfig) -> Option<Arc<dyn PersonDetector>> {
    if !Path::new(&config.model_path).exists() {
        warn!(
            model = %config.model_path,
            "Detection model not found, runs must supply a detections file"
        );
        return None;
    }

    let detector_config = OnnxDetectorConfig {
        execution_provider: config.execution_provider.clone(),
        ..OnnxDetectorConfig::new(config.model_path.clone())
    };

    match OnnxPersonDetector::load(detector_config) {
        Ok(detector) => Some(Arc::new(detector)),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to load detection model");
            None
        }
    }
}

async fn shutdown_signal(state: ServiceState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
    state.shutdown().await;
}
