//! Per-run analysis loop.
//!
//! One task per run reads frames, samples them, runs detection and the crowd
//! engine, persists counts and alerts, publishes events and the latest
//! rendered frame. Engine state is owned by the task. Persistence and
//! broadcast failures are logged and never stop the run.

use crate::broadcast::Broadcaster;
use crate::detector::PersonDetector;
use crate::render::{FrameRenderer, RenderedFrame};
use crate::source::FrameSource;
use crate::store::LogStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::crowd::{Alert, CrowdEvent};
use common::runs::{RunState, RunStatus};
use crowd_engine::{
    equalize_contrast, CrowdAnalyzer, EngineConfig, FrameSampler, SurgeMonitor, Thresholds,
};
use image::RgbImage;
use std::borrow::Cow;
use std::sync::Arc;
use telemetry::metrics::{
    CROWD_ACTIVE_RUNS, CROWD_ALERTS_RAISED, CROWD_DETECTOR_FAILURES, CROWD_FRAMES_ANALYZED,
    CROWD_FRAMES_DECODED, CROWD_FRAME_LATENCY, CROWD_PERSONS_DETECTED, CROWD_STORE_FAILURES,
};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type FrameSlot = watch::Sender<Option<Arc<RenderedFrame>>>;

/// Everything a run needs, assembled by the service state
pub struct RunContext {
    pub run_id: String,
    pub source: Box<dyn FrameSource>,
    pub detector: Arc<dyn PersonDetector>,
    pub store: Arc<dyn LogStore>,
    pub broadcaster: Broadcaster,
    pub thresholds: Thresholds,
    pub frames: Arc<FrameSlot>,
    pub renderer: FrameRenderer,
    pub engine: EngineConfig,
    pub status: Arc<RwLock<RunStatus>>,
    pub cancel: CancellationToken,
}

enum Exit {
    Exhausted,
    Cancelled,
}

pub struct Pipeline {
    ctx: RunContext,
    analyzer: CrowdAnalyzer,
    sampler: FrameSampler,
    monitor: SurgeMonitor,
}

impl Pipeline {
    /// Build fresh engine state sized to the source's frames
    pub fn new(ctx: RunContext) -> Result<Self> {
        let (width, height) = ctx.source.dimensions();
        let analyzer = CrowdAnalyzer::new(width, height, &ctx.engine)
            .context("invalid engine configuration")?;

        Ok(Self {
            sampler: FrameSampler::new(ctx.engine.skip_rate),
            monitor: SurgeMonitor::new(ctx.engine.monitor_window),
            analyzer,
            ctx,
        })
    }

    /// Drive the run to completion and record its final state
    pub async fn run(mut self) -> RunState {
        CROWD_ACTIVE_RUNS.inc();
        info!(
            run_id = %self.ctx.run_id,
            source = self.ctx.source.describe(),
            detector = self.ctx.detector.name(),
            skip_rate = self.sampler.skip_rate(),
            "analysis run started"
        );

        let outcome = self.drive().await;
        CROWD_ACTIVE_RUNS.dec();

        let (state, last_error) = match outcome {
            Ok(Exit::Exhausted) => (RunState::Completed, None),
            Ok(Exit::Cancelled) => (RunState::Stopped, None),
            Err(e) => {
                error!(run_id = %self.ctx.run_id, error = %format!("{:#}", e), "analysis run failed");
                (RunState::Failed, Some(format!("{:#}", e)))
            }
        };

        {
            let mut status = self.ctx.status.write().await;
            status.state = state;
            status.last_error = last_error;
        }

        info!(
            run_id = %self.ctx.run_id,
            state = ?state,
            frames_seen = self.sampler.frames_seen(),
            "analysis run finished"
        );
        state
    }

    async fn drive(&mut self) -> Result<Exit> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Ok(Exit::Cancelled),
                next = self.ctx.source.next_frame() => next,
            };

            let Some(frame) = next.context("failed to read frame")? else {
                return Ok(Exit::Exhausted);
            };
            CROWD_FRAMES_DECODED.inc();

            if self.sampler.next_frame() {
                let index = self.sampler.frames_seen();
                let count = self.analyze_frame(index, &frame).await;
                let mut status = self.ctx.status.write().await;
                status.frames_seen = index;
                if let Some(count) = count {
                    status.frames_analyzed += 1;
                    status.last_count = count;
                }
            } else {
                self.ctx.status.write().await.frames_seen = self.sampler.frames_seen();
            }
        }
    }

    /// Analyze one sampled frame. Returns the person count, or `None` when
    /// detection failed and the frame was skipped.
    async fn analyze_frame(&mut self, index: u64, frame: &RgbImage) -> Option<u32> {
        let timer = CROWD_FRAME_LATENCY.start_timer();

        let frame = if self.ctx.engine.equalize_contrast {
            Cow::Owned(equalize_contrast(frame))
        } else {
            Cow::Borrowed(frame)
        };

        let centroids = match self.ctx.detector.detect(index, &frame).await {
            Ok(centroids) => centroids,
            Err(e) => {
                CROWD_DETECTOR_FAILURES.inc();
                warn!(run_id = %self.ctx.run_id, frame = index, error = %e, "person detection failed, skipping frame");
                return None;
            }
        };

        let analysis = self.analyzer.analyze(&centroids);
        let count = analysis.count;
        let now = Utc::now();

        for alert in analysis.alerts.iter().cloned() {
            self.raise(alert, now).await;
        }

        let recent = self.persist_count(count, now).await;
        let monitor_alerts = self
            .monitor
            .check(count, &recent, self.ctx.thresholds.snapshot());
        for alert in monitor_alerts {
            self.raise(alert, now).await;
        }

        match self.ctx.renderer.render(
            &frame,
            index,
            &centroids,
            &analysis.zones,
            self.analyzer.layout().cell_size(),
            self.analyzer.heatmap(),
        ) {
            Ok(rendered) => {
                self.ctx.frames.send_replace(Some(Arc::new(rendered)));
            }
            Err(e) => warn!(run_id = %self.ctx.run_id, frame = index, error = %format!("{:#}", e), "failed to render frame"),
        }

        let clients = self
            .ctx
            .broadcaster
            .publish(CrowdEvent::CrowdUpdate(analysis.count_update()));

        CROWD_FRAMES_ANALYZED.inc();
        CROWD_PERSONS_DETECTED.set(i64::from(count));
        timer.observe_duration();

        debug!(
            run_id = %self.ctx.run_id,
            frame = index,
            count,
            zones = analysis.zones.len(),
            velocity = analysis.velocity.avg,
            clients,
            "analyzed frame"
        );
        Some(count)
    }

    /// Persist the count and read back the newest persisted counts for the
    /// surge check. An empty result skips the surge check for this frame.
    async fn persist_count(&self, count: u32, at: DateTime<Utc>) -> Vec<u32> {
        if let Err(e) = self.ctx.store.append_count(count, at).await {
            CROWD_STORE_FAILURES.with_label_values(&["append_count"]).inc();
            warn!(run_id = %self.ctx.run_id, error = %format!("{:#}", e), "failed to persist count");
            return Vec::new();
        }

        match self.ctx.store.recent_counts(self.monitor.window()).await {
            Ok(records) => records.iter().map(|r| r.count).collect(),
            Err(e) => {
                CROWD_STORE_FAILURES.with_label_values(&["recent_counts"]).inc();
                warn!(run_id = %self.ctx.run_id, error = %format!("{:#}", e), "failed to read recent counts, skipping surge check");
                Vec::new()
            }
        }
    }

    async fn raise(&self, alert: Alert, at: DateTime<Utc>) {
        CROWD_ALERTS_RAISED
            .with_label_values(&[alert.kind.as_str(), alert.origin.as_str()])
            .inc();
        info!(
            run_id = %self.ctx.run_id,
            kind = %alert.kind,
            severity = %alert.severity,
            origin = alert.origin.as_str(),
            count = alert.count,
            "{}",
            alert.message
        );

        if let Err(e) = self.ctx.store.append_alert(alert.kind, alert.count, at).await {
            CROWD_STORE_FAILURES.with_label_values(&["append_alert"]).inc();
            warn!(run_id = %self.ctx.run_id, error = %format!("{:#}", e), "failed to persist alert");
        }

        self.ctx.broadcaster.publish(CrowdEvent::from_alert(alert));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ScriptedDetector;
    use crate::source::SourceError;
    use crate::store::MemoryLogStore;
    use async_trait::async_trait;
    use common::crowd::{AlertKind, Centroid};
    use std::collections::{HashMap, VecDeque};

    /// In-memory frames of a fixed size
    struct StaticFrames {
        remaining: VecDeque<RgbImage>,
        size: (u32, u32),
    }

    impl StaticFrames {
        fn new(count: usize, width: u32, height: u32) -> Self {
            Self {
                remaining: (0..count).map(|_| RgbImage::new(width, height)).collect(),
                size: (width, height),
            }
        }
    }

    #[async_trait]
    impl FrameSource for StaticFrames {
        fn describe(&self) -> &str {
            "static"
        }

        fn dimensions(&self) -> (u32, u32) {
            self.size
        }

        async fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            Ok(self.remaining.pop_front())
        }
    }

    struct Harness {
        store: Arc<MemoryLogStore>,
        broadcaster: Broadcaster,
        frames: Arc<FrameSlot>,
        status: Arc<RwLock<RunStatus>>,
        cancel: CancellationToken,
    }

    fn build(
        source: StaticFrames,
        script: HashMap<u64, Vec<Centroid>>,
        thresholds: Thresholds,
    ) -> (Pipeline, Harness) {
        let (width, height) = source.size;
        let store = Arc::new(MemoryLogStore::new());
        let broadcaster = Broadcaster::new(64);
        let (tx, _) = watch::channel(None);
        let frames = Arc::new(tx);
        let status = Arc::new(RwLock::new(RunStatus {
            run_id: "test-run".to_string(),
            source: "static".to_string(),
            state: RunState::Running,
            width,
            height,
            frames_seen: 0,
            frames_analyzed: 0,
            last_count: 0,
            started_at: 0,
            last_error: None,
        }));
        let cancel = CancellationToken::new();

        let pipeline = Pipeline::new(RunContext {
            run_id: "test-run".to_string(),
            source: Box::new(source),
            detector: Arc::new(ScriptedDetector::new(script)),
            store: store.clone(),
            broadcaster: broadcaster.clone(),
            thresholds,
            frames: frames.clone(),
            renderer: FrameRenderer::new(80, 60, 70),
            engine: EngineConfig {
                skip_rate: 1,
                ..EngineConfig::default()
            },
            status: status.clone(),
            cancel: cancel.clone(),
        })
        .unwrap();

        (
            pipeline,
            Harness {
                store,
                broadcaster,
                frames,
                status,
                cancel,
            },
        )
    }

    fn people(n: usize) -> Vec<Centroid> {
        (0..n).map(|i| Centroid::new(20 + (i as i32 % 10) * 25, 20 + (i as i32 / 10) * 25)).collect()
    }

    #[tokio::test]
    async fn test_run_completes_and_publishes() {
        let script = HashMap::from([(1, people(2)), (2, people(3))]);
        let (pipeline, harness) = build(StaticFrames::new(2, 320, 240), script, Thresholds::default());
        let mut events = harness.broadcaster.subscribe();

        assert_eq!(pipeline.run().await, RunState::Completed);

        let status = harness.status.read().await.clone();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.frames_seen, 2);
        assert_eq!(status.frames_analyzed, 2);
        assert_eq!(status.last_count, 3);

        let counts: Vec<u32> = harness
            .store
            .recent_counts(10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.count)
            .collect();
        assert_eq!(counts, vec![3, 2]);

        assert_eq!(
            events.recv().await.unwrap(),
            CrowdEvent::CrowdUpdate(common::crowd::CountUpdate::new(2))
        );

        let latest = harness.frames.borrow().clone().unwrap();
        assert_eq!(latest.frame_index, 2);
        assert_eq!((latest.width, latest.height), (80, 60));
    }

    #[tokio::test]
    async fn test_far_out_centroids_do_not_end_the_run() {
        let script = HashMap::from([
            (1, vec![Centroid::new(i32::MAX, 0), Centroid::new(10, 10)]),
            (2, vec![Centroid::new(-1, 0), Centroid::new(i32::MIN, i32::MAX)]),
        ]);
        let (pipeline, harness) = build(StaticFrames::new(2, 320, 240), script, Thresholds::default());

        assert_eq!(pipeline.run().await, RunState::Completed);
        assert_eq!(harness.status.read().await.frames_analyzed, 2);
        assert!(harness.frames.borrow().is_some());
    }

    #[tokio::test]
    async fn test_monitor_alerts_follow_runtime_thresholds() {
        let script = HashMap::from([(1, people(1)), (2, people(6))]);
        let thresholds = Thresholds::new(5, 4);
        let (pipeline, harness) = build(StaticFrames::new(2, 320, 240), script, thresholds);

        pipeline.run().await;

        let kinds: Vec<String> = harness
            .store
            .recent_alerts(10)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.kind)
            .collect();
        // Newest first: the threshold check runs after the surge check
        assert_eq!(
            kinds,
            vec![
                AlertKind::CrowdThresholdExceeded.to_string(),
                AlertKind::CrowdSurge.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_frames_are_still_analyzed() {
        let (pipeline, harness) = build(StaticFrames::new(3, 64, 64), HashMap::new(), Thresholds::default());
        pipeline.run().await;

        let status = harness.status.read().await.clone();
        assert_eq!(status.frames_analyzed, 3);
        assert_eq!(status.last_count, 0);
        assert_eq!(harness.store.recent_counts(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops() {
        let (pipeline, harness) = build(StaticFrames::new(5, 64, 64), HashMap::new(), Thresholds::default());
        harness.cancel.cancel();

        assert_eq!(pipeline.run().await, RunState::Stopped);
        assert_eq!(harness.status.read().await.state, RunState::Stopped);
        assert!(harness.store.recent_counts(10).await.unwrap().is_empty());
    }
}
