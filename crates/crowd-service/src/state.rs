use crate::broadcast::Broadcaster;
use crate::detector::{PersonDetector, ScriptedDetector};
use crate::error::ApiError;
use crate::pipeline::{FrameSlot, Pipeline, RunContext};
use crate::render::{FrameRenderer, RenderedFrame};
use crate::source::open_source;
use crate::store::LogStore;
use common::crowd::CrowdEvent;
use common::runs::{RunStartRequest, RunState, RunStatus};
use crowd_engine::{EngineConfig, Thresholds};
use std::sync::Arc;
use telemetry::metrics::{CROWD_ACTIVE_RUNS, CROWD_STORE_FAILURES};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared service state handed to every handler
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<ServiceStateInner>,
}

struct ServiceStateInner {
    engine: EngineConfig,
    renderer: FrameRenderer,
    thresholds: Thresholds,
    store: Arc<dyn LogStore>,
    broadcaster: Broadcaster,
    frames: Arc<FrameSlot>,
    detector: Option<Arc<dyn PersonDetector>>,
    run: Mutex<Option<ActiveRun>>,
}

/// The current run, or the last one once it has finished
struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
    status: Arc<RwLock<RunStatus>>,
    task: Option<JoinHandle<RunState>>,
}

impl ActiveRun {
    /// Cancel the task and wait for it to record its final state
    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            self.join(task).await;
        }
    }

    /// Collect a task that has already ended, so a panicked run is reported
    /// as failed instead of running
    async fn reap(&mut self) {
        if self.task.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(task) = self.task.take() {
                self.join(task).await;
            }
        }
    }

    async fn join(&self, task: JoinHandle<RunState>) {
        if let Err(e) = task.await {
            warn!(run_id = %self.run_id, error = %e, "analysis task ended abnormally");
            if e.is_panic() {
                CROWD_ACTIVE_RUNS.dec();
            }
            let mut status = self.status.write().await;
            status.state = RunState::Failed;
            status.last_error = Some(e.to_string());
        }
    }
}

impl ServiceState {
    pub fn new(
        engine: EngineConfig,
        renderer: FrameRenderer,
        thresholds: Thresholds,
        store: Arc<dyn LogStore>,
        detector: Option<Arc<dyn PersonDetector>>,
    ) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            inner: Arc::new(ServiceStateInner {
                engine,
                renderer,
                thresholds,
                store,
                broadcaster: Broadcaster::default(),
                frames: Arc::new(frames),
                detector,
                run: Mutex::new(None),
            }),
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.inner.thresholds
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.inner.store
    }

    pub fn has_detector(&self) -> bool {
        self.inner.detector.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrowdEvent> {
        self.inner.broadcaster.subscribe()
    }

    pub fn latest_frame(&self) -> Option<Arc<RenderedFrame>> {
        self.inner.frames.borrow().clone()
    }

    pub fn watch_frames(&self) -> watch::Receiver<Option<Arc<RenderedFrame>>> {
        self.inner.frames.subscribe()
    }

    /// Start analysing a new source.
    ///
    /// The source and detector are resolved first, so a bad request leaves
    /// the current run untouched. Otherwise the current run is stopped and
    /// all per-run state is reset before the new run begins.
    pub async fn start_run(&self, request: RunStartRequest) -> Result<RunStatus, ApiError> {
        let skip_rate = request.skip_rate.unwrap_or(self.inner.engine.skip_rate);
        if skip_rate == 0 {
            return Err(ApiError::bad_request("skip_rate must be at least 1"));
        }

        let detector: Arc<dyn PersonDetector> = match &request.detections {
            Some(path) => Arc::new(
                ScriptedDetector::from_path(path)
                    .await
                    .map_err(|e| ApiError::bad_request(format!("{:#}", e)))?,
            ),
            None => self.inner.detector.clone().ok_or_else(|| {
                ApiError::bad_request("no detection model loaded; supply a detections file")
            })?,
        };

        let source = open_source(&request.source).await?;
        let (width, height) = source.dimensions();

        let mut current = self.inner.run.lock().await;
        if let Some(previous) = current.as_mut() {
            previous.stop().await;
        }

        if let Err(e) = self.inner.store.clear().await {
            CROWD_STORE_FAILURES.with_label_values(&["clear"]).inc();
            warn!(error = %format!("{:#}", e), "failed to clear crowd log for new run");
        }
        self.inner.frames.send_replace(None);

        let run_id = Uuid::new_v4().to_string();
        let status = RunStatus {
            run_id: run_id.clone(),
            source: request.source.clone(),
            state: RunState::Running,
            width,
            height,
            frames_seen: 0,
            frames_analyzed: 0,
            last_count: 0,
            started_at: chrono::Utc::now().timestamp_millis().max(0) as u64,
            last_error: None,
        };
        let shared_status = Arc::new(RwLock::new(status.clone()));
        let cancel = CancellationToken::new();

        let pipeline = Pipeline::new(RunContext {
            run_id: run_id.clone(),
            source,
            detector,
            store: self.inner.store.clone(),
            broadcaster: self.inner.broadcaster.clone(),
            thresholds: self.inner.thresholds.clone(),
            frames: self.inner.frames.clone(),
            renderer: self.inner.renderer,
            engine: EngineConfig {
                skip_rate,
                ..self.inner.engine.clone()
            },
            status: shared_status.clone(),
            cancel: cancel.clone(),
        })?;

        let task = tokio::spawn(pipeline.run());
        *current = Some(ActiveRun {
            run_id: run_id.clone(),
            cancel,
            status: shared_status,
            task: Some(task),
        });

        info!(run_id = %run_id, source = %request.source, width, height, skip_rate, "started run");
        Ok(status)
    }

    /// Stop the current run. Returns `None` when no run was ever started.
    pub async fn stop_run(&self) -> Option<RunStatus> {
        let mut current = self.inner.run.lock().await;
        let run = current.as_mut()?;
        run.stop().await;
        let status = run.status.read().await.clone();
        info!(run_id = %run.run_id, state = ?status.state, "stopped run");
        Some(status)
    }

    pub async fn run_status(&self) -> Option<RunStatus> {
        let mut current = self.inner.run.lock().await;
        let run = current.as_mut()?;
        run.reap().await;
        let status = run.status.read().await.clone();
        Some(status)
    }

    pub async fn shutdown(&self) {
        if let Some(status) = self.stop_run().await {
            info!(run_id = %status.run_id, "analysis stopped for shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLogStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use common::crowd::Centroid;
    use image::{Rgb, RgbImage};
    use std::io::Write;
    use std::time::Duration;

    fn state(detector: Option<Arc<dyn PersonDetector>>) -> (ServiceState, Arc<MemoryLogStore>) {
        let store = Arc::new(MemoryLogStore::new());
        let state = ServiceState::new(
            EngineConfig::default(),
            FrameRenderer::new(64, 48, 70),
            Thresholds::default(),
            store.clone(),
            detector,
        );
        (state, store)
    }

    fn frames_dir(count: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..count {
            RgbImage::from_pixel(128, 96, Rgb([10, 10, 10]))
                .save(dir.path().join(format!("frame_{:03}.png", i)))
                .unwrap();
        }
        dir
    }

    async fn wait_for_state(state: &ServiceState, expected: RunState) -> RunStatus {
        for _ in 0..200 {
            if let Some(status) = state.run_status().await {
                if status.state == expected {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never reached {:?}", expected);
    }

    #[tokio::test]
    async fn test_start_without_detector_is_rejected() {
        let (state, _) = state(None);
        let dir = frames_dir(1);
        let err = state
            .start_run(RunStartRequest {
                source: dir.path().to_string_lossy().into_owned(),
                detections: None,
                skip_rate: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(state.run_status().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_source_is_rejected() {
        let (state, _) = state(Some(Arc::new(ScriptedDetector::new(Default::default()))));
        let err = state
            .start_run(RunStartRequest {
                source: "/definitely/not/here.mp4".to_string(),
                detections: None,
                skip_rate: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_zero_skip_rate_is_rejected() {
        let (state, _) = state(Some(Arc::new(ScriptedDetector::new(Default::default()))));
        let dir = frames_dir(1);
        let err = state
            .start_run(RunStartRequest {
                source: dir.path().to_string_lossy().into_owned(),
                detections: None,
                skip_rate: Some(0),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_with_scripted_detections_completes() {
        let (state, store) = state(None);
        let dir = frames_dir(4);

        let script_path = dir.path().join("detections.jsonl");
        let mut script = std::fs::File::create(&script_path).unwrap();
        writeln!(script, r#"{{"frame": 2, "centroids": [[10, 10], [40, 40]]}}"#).unwrap();
        writeln!(script, r#"{{"frame": 4, "centroids": [[12, 10], [42, 40], [90, 60]]}}"#).unwrap();

        let started = state
            .start_run(RunStartRequest {
                source: dir.path().to_string_lossy().into_owned(),
                detections: Some(script_path.to_string_lossy().into_owned()),
                skip_rate: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(started.state, RunState::Running);
        assert_eq!((started.width, started.height), (128, 96));

        let finished = wait_for_state(&state, RunState::Completed).await;
        assert_eq!(finished.frames_seen, 4);
        assert_eq!(finished.frames_analyzed, 2);
        assert_eq!(finished.last_count, 3);

        let counts: Vec<u32> = store
            .recent_counts(10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.count)
            .collect();
        assert_eq!(counts, vec![3, 2]);
        assert_eq!(state.latest_frame().unwrap().frame_index, 4);
    }

    #[tokio::test]
    async fn test_new_run_resets_log_and_frame() {
        let (state, store) = state(Some(Arc::new(ScriptedDetector::new(Default::default()))));
        store.append_count(42, Utc::now()).await.unwrap();

        let dir = frames_dir(1);
        state
            .start_run(RunStartRequest {
                source: dir.path().to_string_lossy().into_owned(),
                detections: None,
                skip_rate: Some(5),
            })
            .await
            .unwrap();

        // One frame with skip rate 5 is never analysed
        let finished = wait_for_state(&state, RunState::Completed).await;
        assert_eq!(finished.frames_analyzed, 0);
        assert!(store.recent_counts(10).await.unwrap().is_empty());
        assert!(state.latest_frame().is_none());
    }

    struct PanickingDetector;

    #[async_trait]
    impl PersonDetector for PanickingDetector {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn detect(&self, _frame_index: u64, _frame: &RgbImage) -> Result<Vec<Centroid>> {
            panic!("detector blew up");
        }
    }

    #[tokio::test]
    async fn test_panicked_run_is_reported_failed() {
        let (state, _) = state(Some(Arc::new(PanickingDetector)));
        let dir = frames_dir(2);
        state
            .start_run(RunStartRequest {
                source: dir.path().to_string_lossy().into_owned(),
                detections: None,
                skip_rate: Some(1),
            })
            .await
            .unwrap();

        let failed = wait_for_state(&state, RunState::Failed).await;
        assert!(failed.last_error.unwrap().contains("panicked"));

        // Stopping afterwards keeps the recorded failure
        let stopped = state.stop_run().await.unwrap();
        assert_eq!(stopped.state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_stop_without_run() {
        let (state, _) = state(None);
        assert!(state.stop_run().await.is_none());
        assert!(state.run_status().await.is_none());
    }
}
