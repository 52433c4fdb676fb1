use crate::error::ApiError;
use crate::state::ServiceState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use common::runs::{
    RecentAlert, RecentCount, RunStartRequest, RunStartResponse, RunState, RunStatus,
    ThresholdsUpdate, ThresholdsView,
};
use serde_json::json;
use telemetry::metrics::CROWD_THRESHOLD_UPDATES;
use tracing::warn;

const RECENT_COUNTS_LIMIT: usize = 20;
const RECENT_ALERTS_LIMIT: usize = 10;
const CLOCK_FORMAT: &str = "%H:%M:%S";

/// Health check endpoint
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "crowd-service",
            "version": common::VERSION
        })),
    )
}

/// Ready while a run is analysing frames
pub async fn readyz(State(state): State<ServiceState>) -> impl IntoResponse {
    match state.run_status().await {
        Some(status) if status.state == RunState::Running => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "run_id": status.run_id
            })),
        ),
        other => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "state": other.map(|s| s.state)
            })),
        ),
    }
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics() -> impl IntoResponse {
    match telemetry::encode_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Start analysing a source, replacing any current run
pub async fn start_run(
    State(state): State<ServiceState>,
    Json(request): Json<RunStartRequest>,
) -> Result<Json<RunStartResponse>, ApiError> {
    let source = request.source.clone();
    let status = state.start_run(request).await.inspect_err(|e| {
        warn!(source = %source, error = %e, "rejected run start");
    })?;

    Ok(Json(RunStartResponse {
        accepted: true,
        message: Some(format!("Analysing {}", status.source)),
        run_id: Some(status.run_id),
    }))
}

pub async fn get_run(State(state): State<ServiceState>) -> Result<Json<RunStatus>, ApiError> {
    state
        .run_status()
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no run has been started"))
}

pub async fn stop_run(State(state): State<ServiceState>) -> Result<Json<RunStatus>, ApiError> {
    state
        .stop_run()
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no run has been started"))
}

pub async fn get_thresholds(State(state): State<ServiceState>) -> Json<ThresholdsView> {
    Json(state.thresholds().snapshot())
}

/// Partial threshold update. A rejected field leaves both values unchanged.
pub async fn update_thresholds(
    State(state): State<ServiceState>,
    Json(update): Json<ThresholdsUpdate>,
) -> Result<Json<ThresholdsView>, ApiError> {
    match state.thresholds().apply(&update) {
        Ok(view) => {
            CROWD_THRESHOLD_UPDATES.with_label_values(&["applied"]).inc();
            Ok(Json(view))
        }
        Err(e) => {
            CROWD_THRESHOLD_UPDATES.with_label_values(&["rejected"]).inc();
            warn!(error = %e, "rejected threshold update");
            Err(e.into())
        }
    }
}

/// Last persisted counts, oldest first
pub async fn recent_counts(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<RecentCount>>, ApiError> {
    let records = state.store().recent_counts(RECENT_COUNTS_LIMIT).await?;
    let counts = records
        .iter()
        .rev()
        .map(|r| RecentCount {
            count: r.count,
            timestamp: r.timestamp.format(CLOCK_FORMAT).to_string(),
        })
        .collect();
    Ok(Json(counts))
}

/// Last persisted alerts, newest first
pub async fn recent_alerts(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<RecentAlert>>, ApiError> {
    let records = state.store().recent_alerts(RECENT_ALERTS_LIMIT).await?;
    let alerts = records
        .into_iter()
        .map(|r| RecentAlert {
            timestamp: r.timestamp.format(CLOCK_FORMAT).to_string(),
            kind: r.kind,
            count: r.count,
        })
        .collect();
    Ok(Json(alerts))
}

/// Latest rendered frame as a single JPEG
pub async fn latest_frame(State(state): State<ServiceState>) -> Result<impl IntoResponse, ApiError> {
    let frame = state
        .latest_frame()
        .ok_or_else(|| ApiError::not_found("no frame has been rendered yet"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        frame.jpeg.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::detector::ScriptedDetector;
    use crate::render::FrameRenderer;
    use crate::state::ServiceState;
    use crate::store::{LogStore, MemoryLogStore};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::{Duration, TimeZone, Utc};
    use common::crowd::AlertKind;
    use common::runs::{RecentAlert, RecentCount, ThresholdsView};
    use crowd_engine::{EngineConfig, Thresholds};
    use serde_json::json;
    use std::sync::Arc;

    fn server() -> (TestServer, Arc<MemoryLogStore>) {
        let store = Arc::new(MemoryLogStore::new());
        let state = ServiceState::new(
            EngineConfig::default(),
            FrameRenderer::new(64, 48, 70),
            Thresholds::default(),
            store.clone(),
            Some(Arc::new(ScriptedDetector::new(Default::default()))),
        );
        (TestServer::new(router(state)).unwrap(), store)
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (server, _) = server();
        server.get("/healthz").await.assert_status_ok();

        let ready = server.get("/readyz").await;
        ready.assert_status(StatusCode::SERVICE_UNAVAILABLE);

        let metrics = server.get("/metrics").await;
        metrics.assert_status_ok();
    }

    #[tokio::test]
    async fn test_threshold_round_trip() {
        let (server, _) = server();

        let current: ThresholdsView = server.get("/v1/thresholds").await.json();
        assert_eq!(current.crowd_threshold, 15);
        assert_eq!(current.surge_limit, 8);

        let updated = server
            .put("/v1/thresholds")
            .json(&json!({"surge_limit": "6"}))
            .await;
        updated.assert_status_ok();
        let view: ThresholdsView = updated.json();
        assert_eq!(view.surge_limit, 6);
        assert_eq!(view.crowd_threshold, 15);
    }

    #[tokio::test]
    async fn test_malformed_threshold_is_rejected() {
        let (server, _) = server();

        let response = server
            .put("/v1/thresholds")
            .json(&json!({"crowd_threshold": 20, "surge_limit": "lots"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let current: ThresholdsView = server.get("/v1/thresholds").await.json();
        assert_eq!(current.crowd_threshold, 15);
        assert_eq!(current.surge_limit, 8);
    }

    #[tokio::test]
    async fn test_recent_counts_are_oldest_first() {
        let (server, store) = server();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 14, 5, 0).unwrap();
        for i in 0..25u32 {
            store
                .append_count(i, start + Duration::seconds(i64::from(i)))
                .await
                .unwrap();
        }

        let counts: Vec<RecentCount> = server.get("/api/recent_counts").await.json();
        assert_eq!(counts.len(), 20);
        assert_eq!(counts[0].count, 5);
        assert_eq!(counts[0].timestamp, "14:05:05");
        assert_eq!(counts[19].count, 24);
    }

    #[tokio::test]
    async fn test_recent_alerts_are_newest_first() {
        let (server, store) = server();
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 15).unwrap();
        for i in 0..12u32 {
            store.append_alert(AlertKind::CrowdSurge, i, at).await.unwrap();
        }
        store
            .append_alert(AlertKind::CrowdThresholdExceeded, 40, at)
            .await
            .unwrap();

        let alerts: Vec<RecentAlert> = server.get("/api/recent_alerts").await.json();
        assert_eq!(alerts.len(), 10);
        assert_eq!(alerts[0].kind, "crowd_threshold_exceeded");
        assert_eq!(alerts[0].count, 40);
        assert_eq!(alerts[0].timestamp, "09:30:15");
        assert_eq!(alerts[1].count, 11);
    }

    #[tokio::test]
    async fn test_run_endpoints_before_any_run() {
        let (server, _) = server();
        server.get("/v1/runs").await.assert_status(StatusCode::NOT_FOUND);
        server.delete("/v1/runs").await.assert_status(StatusCode::NOT_FOUND);
        server.get("/v1/frame").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_run_with_missing_source() {
        let (server, _) = server();
        let response = server
            .post("/v1/runs")
            .json(&json!({"source": "/no/such/video.mp4"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let body: serde_json::Value = response.json();
        assert!(body["error"].as_str().unwrap().contains("/no/such/video.mp4"));
    }
}
