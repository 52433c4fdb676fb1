/// End-to-end tests for the crowd service: a run over still frames with
/// scripted detections, driven entirely through the HTTP API
use axum_test::TestServer;
use common::runs::{RecentAlert, RecentCount, RunStartResponse, RunStatus, ThresholdsView};
use crowd_engine::{EngineConfig, Thresholds};
use crowd_service::render::FrameRenderer;
use crowd_service::store::MemoryLogStore;
use crowd_service::{api, ServiceState};
use image::{Rgb, RgbImage};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn setup_test_service() -> (TestServer, ServiceState) {
    let state = ServiceState::new(
        EngineConfig::default(),
        FrameRenderer::new(160, 120, 75),
        Thresholds::default(),
        Arc::new(MemoryLogStore::new()),
        None,
    );
    let server = TestServer::new(api::router(state.clone())).unwrap();
    (server, state)
}

fn write_frames(dir: &Path, count: usize) {
    for i in 0..count {
        RgbImage::from_pixel(320, 240, Rgb([30, 30, 30]))
            .save(dir.join(format!("frame_{:04}.jpg", i)))
            .unwrap();
    }
}

fn write_detections(dir: &Path, lines: &[serde_json::Value]) -> String {
    let path = dir.join("detections.jsonl");
    let body: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    std::fs::write(&path, body.join("\n")).unwrap();
    path.to_string_lossy().into_owned()
}

async fn wait_for_completion(server: &TestServer) -> RunStatus {
    for _ in 0..300 {
        let status: RunStatus = server.get("/v1/runs").await.json();
        if status.state != common::runs::RunState::Running {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run did not finish in time");
}

#[tokio::test]
async fn test_run_persists_counts_and_alerts() {
    let (server, _state) = setup_test_service();
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 3);
    let detections = write_detections(
        dir.path(),
        &[
            json!({"frame": 1, "centroids": [[10, 10]]}),
            json!({"frame": 2, "centroids": [[10, 10], [30, 10], [50, 10], [70, 10]]}),
            json!({"frame": 3, "centroids": [[10, 10], [30, 10], [50, 10], [70, 10]]}),
        ],
    );

    server
        .put("/v1/thresholds")
        .json(&json!({"crowd_threshold": 3, "surge_limit": 2}))
        .await
        .assert_status_ok();

    let response = server
        .post("/v1/runs")
        .json(&json!({
            "source": dir.path().to_string_lossy(),
            "detections": detections,
            "skip_rate": 1
        }))
        .await;
    response.assert_status_ok();
    let started: RunStartResponse = response.json();
    assert!(started.accepted);

    let status = wait_for_completion(&server).await;
    assert_eq!(status.state, common::runs::RunState::Completed);
    assert_eq!(Some(status.run_id), started.run_id);
    assert_eq!(status.frames_seen, 3);
    assert_eq!(status.frames_analyzed, 3);
    assert_eq!(status.last_count, 4);
    assert_eq!((status.width, status.height), (320, 240));

    let counts: Vec<RecentCount> = server.get("/api/recent_counts").await.json();
    let counts: Vec<u32> = counts.iter().map(|c| c.count).collect();
    assert_eq!(counts, vec![1, 4, 4]);

    let alerts: Vec<RecentAlert> = server.get("/api/recent_alerts").await.json();
    let kinds: Vec<&str> = alerts.iter().map(|a| a.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            "crowd_threshold_exceeded",
            "crowd_threshold_exceeded",
            "crowd_surge"
        ]
    );

    let frame = server.get("/v1/frame").await;
    frame.assert_status_ok();
    assert_eq!(frame.header("content-type"), "image/jpeg");
    let decoded = image::load_from_memory(frame.as_bytes()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (160, 120));

    // Finished runs are no longer ready
    server
        .get("/readyz")
        .await
        .assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_new_run_starts_from_a_clean_log() {
    let (server, _state) = setup_test_service();
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 2);
    let detections = write_detections(
        dir.path(),
        &[
            json!({"frame": 1, "centroids": [[5, 5], [6, 6]]}),
            json!({"frame": 2, "centroids": [[5, 5]]}),
        ],
    );
    let request = json!({
        "source": dir.path().to_string_lossy(),
        "detections": detections,
        "skip_rate": 1
    });

    server.post("/v1/runs").json(&request).await.assert_status_ok();
    wait_for_completion(&server).await;

    server.post("/v1/runs").json(&request).await.assert_status_ok();
    wait_for_completion(&server).await;

    let counts: Vec<RecentCount> = server.get("/api/recent_counts").await.json();
    assert_eq!(counts.len(), 2);
}

#[tokio::test]
async fn test_rejected_start_keeps_previous_run() {
    let (server, _state) = setup_test_service();
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 1);
    let detections = write_detections(dir.path(), &[json!({"frame": 1, "centroids": [[1, 1]]})]);

    server
        .post("/v1/runs")
        .json(&json!({
            "source": dir.path().to_string_lossy(),
            "detections": detections,
            "skip_rate": 1
        }))
        .await
        .assert_status_ok();
    let first = wait_for_completion(&server).await;

    // No model is loaded, so a run without detections is refused
    server
        .post("/v1/runs")
        .json(&json!({"source": dir.path().to_string_lossy()}))
        .await
        .assert_status(axum::http::StatusCode::BAD_REQUEST);

    let status: RunStatus = server.get("/v1/runs").await.json();
    assert_eq!(status.run_id, first.run_id);

    let counts: Vec<RecentCount> = server.get("/api/recent_counts").await.json();
    assert_eq!(counts.len(), 1);
}

#[tokio::test]
async fn test_threshold_update_validation() {
    let (server, state) = setup_test_service();

    server
        .put("/v1/thresholds")
        .json(&json!({"crowd_threshold": "abc"}))
        .await
        .assert_status(axum::http::StatusCode::BAD_REQUEST);
    server
        .put("/v1/thresholds")
        .json(&json!({"surge_limit": -1}))
        .await
        .assert_status(axum::http::StatusCode::BAD_REQUEST);

    let view: ThresholdsView = server.get("/v1/thresholds").await.json();
    assert_eq!(view.crowd_threshold, 15);
    assert_eq!(view.surge_limit, 8);

    server
        .put("/v1/thresholds")
        .json(&json!({"crowd_threshold": 25.0}))
        .await
        .assert_status_ok();
    assert_eq!(state.thresholds().crowd_threshold(), 25);
    assert_eq!(state.thresholds().surge_limit(), 8);
}
