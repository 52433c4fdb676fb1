/// Per-run crowd analyzer.
///
/// Owns every piece of engine state for one video: grid geometry, the
/// previous-frame positions, velocity and count histories and the heatmap.
/// It is driven by a single pipeline task so nothing here is shared.
use crate::config::{EngineConfig, EngineConfigError};
use crate::grid::{DensityGrid, GridLayout, Zone, ZoneDetector};
use crate::heatmap::HeatmapAccumulator;
use crate::history::BoundedHistory;
use crate::patterns::PatternAlertEngine;
use crate::velocity::{VelocityEstimator, VelocitySample};
use common::crowd::{Alert, Centroid, CountUpdate};
use tracing::debug;

/// Everything the engine derives from one analyzed frame
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub count: u32,
    pub grid: DensityGrid,
    pub zones: Vec<Zone>,
    pub velocity: VelocitySample,
    /// Pattern alerts in rule order
    pub alerts: Vec<Alert>,
}

impl FrameAnalysis {
    pub fn count_update(&self) -> CountUpdate {
        CountUpdate::new(self.count)
    }
}

pub struct CrowdAnalyzer {
    layout: GridLayout,
    zones: ZoneDetector,
    velocity: VelocityEstimator,
    patterns: PatternAlertEngine,
    heatmap: HeatmapAccumulator,
}

impl CrowdAnalyzer {
    /// Grid and heatmap dimensions are fixed here from the first readable frame
    pub fn new(
        frame_width: u32,
        frame_height: u32,
        config: &EngineConfig,
    ) -> Result<Self, EngineConfigError> {
        config.validate()?;

        let layout = GridLayout::new(frame_width, frame_height, config.cell_size);
        debug!(
            rows = layout.rows(),
            cols = layout.cols(),
            frame_width,
            frame_height,
            "created crowd analyzer"
        );

        Ok(Self {
            layout,
            zones: ZoneDetector::new(
                config.high_density_threshold,
                config.critical_density_threshold,
            ),
            velocity: VelocityEstimator::new(config.match_distance, config.history_capacity),
            patterns: PatternAlertEngine::new(config),
            heatmap: HeatmapAccumulator::new(frame_width, frame_height, config.heatmap.clone()),
        })
    }

    /// Run the full per-frame analysis. An empty slice is a valid frame.
    pub fn analyze(&mut self, centroids: &[Centroid]) -> FrameAnalysis {
        let count = centroids.len() as u32;

        let grid = self.layout.compute_grid(centroids);
        let zones = self.zones.detect_zones(&grid);
        let velocity = self.velocity.estimate(centroids);
        let alerts = self.patterns.evaluate(velocity, &zones, count);
        self.heatmap.stamp(centroids);

        FrameAnalysis {
            count,
            grid,
            zones,
            velocity,
            alerts,
        }
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn heatmap(&self) -> &HeatmapAccumulator {
        &self.heatmap
    }

    pub fn count_history(&self) -> &BoundedHistory<u32> {
        self.patterns.count_history()
    }

    pub fn velocity_history(&self) -> &BoundedHistory<f64> {
        self.velocity.history()
    }

    pub fn previous_positions(&self) -> &[Centroid] {
        self.velocity.previous_positions()
    }

    /// Forget everything learned so far; geometry is kept
    pub fn reset(&mut self) {
        self.velocity.reset();
        self.patterns.reset();
        self.heatmap.reset();
    }
}
