//! Prometheus metrics for the crowd service.
//!
//! Metric names and label sets are fixed at compile time, so construction
//! failures are programming errors.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref CROWD_FRAMES_DECODED: IntCounter = {
        let metric = IntCounter::new(
            "crowd_frames_decoded_total",
            "Total number of frames read from video sources",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_FRAMES_ANALYZED: IntCounter = {
        let metric = IntCounter::new(
            "crowd_frames_analyzed_total",
            "Total number of sampled frames run through the crowd engine",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_PERSONS_DETECTED: IntGauge = {
        let metric = IntGauge::new(
            "crowd_persons_detected",
            "People detected in the most recently analyzed frame",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_ALERTS_RAISED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("crowd_alerts_total", "Total number of crowd alerts raised"),
            &["type", "origin"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_FRAME_LATENCY: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new(
                "crowd_frame_processing_seconds",
                "Detection, analysis and rendering time per analyzed frame",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_STORE_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "crowd_store_failures_total",
                "Log store operations that failed and were skipped",
            ),
            &["operation"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_DETECTOR_FAILURES: IntCounter = {
        let metric = IntCounter::new(
            "crowd_detector_failures_total",
            "Frames whose person detection failed",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_ACTIVE_RUNS: IntGauge = {
        let metric = IntGauge::new("crowd_active_runs", "Number of running analysis runs")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_LIVE_CLIENTS: IntGauge = {
        let metric = IntGauge::new(
            "crowd_live_clients",
            "Connected websocket and video feed clients",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CROWD_THRESHOLD_UPDATES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "crowd_threshold_updates_total",
                "Threshold update requests by outcome",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Encode all metrics in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}
