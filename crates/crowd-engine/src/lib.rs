//! Crowd analytics and alerting engine.
//!
//! Turns the person centroids of each analyzed frame into a density grid,
//! risk zones, a velocity estimate, pattern alerts and a cumulative heatmap.
//! The surge monitor and runtime thresholds evaluate persisted counts
//! alongside it.

pub mod analyzer;
pub mod config;
pub mod contrast;
pub mod grid;
pub mod heatmap;
pub mod history;
pub mod patterns;
pub mod sampler;
pub mod surge;
pub mod thresholds;
pub mod velocity;

pub use analyzer::{CrowdAnalyzer, FrameAnalysis};
pub use contrast::equalize_contrast;
pub use config::{EngineConfig, EngineConfigError, HeatmapConfig};
pub use grid::{DensityGrid, GridLayout, RiskLevel, Zone, ZoneDetector};
pub use heatmap::HeatmapAccumulator;
pub use history::BoundedHistory;
pub use patterns::PatternAlertEngine;
pub use sampler::FrameSampler;
pub use surge::SurgeMonitor;
pub use thresholds::{ThresholdError, Thresholds};
pub use velocity::{VelocityEstimator, VelocitySample};
