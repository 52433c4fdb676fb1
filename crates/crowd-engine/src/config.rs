use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EngineConfigError {
    #[error("cell_size must be positive")]
    ZeroCellSize,

    #[error("skip_rate must be positive")]
    ZeroSkipRate,

    #[error("history_capacity ({capacity}) must hold the surge window ({window})")]
    HistoryTooShort { capacity: usize, window: usize },

    #[error("heatmap decay must be within (0, 1], got {0}")]
    InvalidDecay(f32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Side of a density grid cell, in pixels
    #[serde(default = "default_cell_size")]
    pub cell_size: u32,

    /// Minimum people in one cell for it to become a zone
    #[serde(default = "default_high_density")]
    pub high_density_threshold: u32,

    /// A zone holding more than this many people is critical
    #[serde(default = "default_critical_density")]
    pub critical_density_threshold: u32,

    /// Average displacement (px per analyzed frame) that makes dense zones risky
    #[serde(default = "default_velocity_threshold")]
    pub velocity_threshold: f64,

    /// Average displacement that alone signals panic
    #[serde(default = "default_panic_velocity")]
    pub panic_velocity_threshold: f64,

    /// Nearest-neighbour matches at or beyond this distance are discarded
    #[serde(default = "default_match_distance")]
    pub match_distance: f64,

    /// Capacity of the in-memory count and velocity histories
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Number of recent counts compared by the in-memory surge rule
    #[serde(default = "default_surge_window")]
    pub surge_window: usize,

    /// The in-memory surge rule fires when the window grows by more than this
    #[serde(default = "default_surge_window_delta")]
    pub surge_window_delta: i64,

    /// Process every Nth decoded frame
    #[serde(default = "default_skip_rate")]
    pub skip_rate: u32,

    /// Number of persisted counts read by the surge monitor
    #[serde(default = "default_monitor_window")]
    pub monitor_window: usize,

    /// Equalise frame luminance before detection
    #[serde(default)]
    pub equalize_contrast: bool,

    #[serde(default)]
    pub heatmap: HeatmapConfig,
}

fn default_cell_size() -> u32 {
    100
}

fn default_high_density() -> u32 {
    8
}

fn default_critical_density() -> u32 {
    12
}

fn default_velocity_threshold() -> f64 {
    30.0
}

fn default_panic_velocity() -> f64 {
    60.0
}

fn default_match_distance() -> f64 {
    100.0
}

fn default_history_capacity() -> usize {
    10
}

fn default_surge_window() -> usize {
    3
}

fn default_surge_window_delta() -> i64 {
    10
}

fn default_skip_rate() -> u32 {
    3
}

fn default_monitor_window() -> usize {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cell_size: default_cell_size(),
            high_density_threshold: default_high_density(),
            critical_density_threshold: default_critical_density(),
            velocity_threshold: default_velocity_threshold(),
            panic_velocity_threshold: default_panic_velocity(),
            match_distance: default_match_distance(),
            history_capacity: default_history_capacity(),
            surge_window: default_surge_window(),
            surge_window_delta: default_surge_window_delta(),
            skip_rate: default_skip_rate(),
            monitor_window: default_monitor_window(),
            equalize_contrast: false,
            heatmap: HeatmapConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if self.cell_size == 0 {
            return Err(EngineConfigError::ZeroCellSize);
        }
        if self.skip_rate == 0 {
            return Err(EngineConfigError::ZeroSkipRate);
        }
        if self.history_capacity < self.surge_window {
            return Err(EngineConfigError::HistoryTooShort {
                capacity: self.history_capacity,
                window: self.surge_window,
            });
        }
        if !(self.heatmap.decay > 0.0 && self.heatmap.decay <= 1.0) {
            return Err(EngineConfigError::InvalidDecay(self.heatmap.decay));
        }
        Ok(())
    }
}

/// Heatmap stamping and display parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapConfig {
    /// Radius of the disk stamped per person
    #[serde(default = "default_stamp_radius")]
    pub stamp_radius: i32,

    /// Value written inside a stamped disk
    #[serde(default = "default_stamp_intensity")]
    pub stamp_intensity: f32,

    /// Gaussian kernel size used when rendering (odd)
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: u32,

    /// Scale applied to blurred values before colour mapping
    #[serde(default = "default_display_scale")]
    pub display_scale: f32,

    /// Weight of the heatmap colour when blending over a frame
    #[serde(default = "default_overlay_alpha")]
    pub overlay_alpha: f32,

    /// Per-frame multiplicative decay of the accumulator. 1.0 keeps every trace.
    #[serde(default = "default_decay")]
    pub decay: f32,
}

fn default_stamp_radius() -> i32 {
    20
}

fn default_stamp_intensity() -> f32 {
    255.0
}

fn default_blur_kernel() -> u32 {
    25
}

fn default_display_scale() -> f32 {
    0.4
}

fn default_overlay_alpha() -> f32 {
    0.3
}

fn default_decay() -> f32 {
    1.0
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            stamp_radius: default_stamp_radius(),
            stamp_intensity: default_stamp_intensity(),
            blur_kernel: default_blur_kernel(),
            display_scale: default_display_scale(),
            overlay_alpha: default_overlay_alpha(),
            decay: default_decay(),
        }
    }
}
