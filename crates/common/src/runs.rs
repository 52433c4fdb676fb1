//! Control-plane contracts for analysis runs.
//!
//! A run is one analysis session over one video source. Starting a run
//! resets every piece of per-run state in the service.

use serde::{Deserialize, Serialize};

/// Request to start analysing a video source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartRequest {
    /// Video file, stream URI, or directory of still frames
    pub source: String,

    /// Optional JSON-lines file of pre-computed centroids, replayed instead of
    /// running the detection model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<String>,

    /// Process every Nth frame (default: service setting)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_rate: Option<u32>,
}

/// Response to a run start request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartResponse {
    /// Whether the run was started
    pub accepted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Source opened, frames are being analysed
    Running,

    /// Source reached end of stream
    Completed,

    /// Stopped by an operator or superseded by a new run
    Stopped,

    /// Aborted by an error
    Failed,
}

/// Snapshot of the current (or last) run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,

    pub source: String,

    pub state: RunState,

    /// Frame width in pixels, fixed for the run
    pub width: u32,

    /// Frame height in pixels, fixed for the run
    pub height: u32,

    /// Total decoded frames
    pub frames_seen: u64,

    /// Frames that passed the sampler and went through analytics
    pub frames_analyzed: u64,

    /// Person count of the last analysed frame
    pub last_count: u32,

    /// Timestamp when the run started (Unix timestamp in milliseconds)
    pub started_at: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runtime-adjustable alert thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdsView {
    pub crowd_threshold: i64,
    pub surge_limit: i64,
}

/// Partial threshold update.
///
/// Values are kept as raw JSON so that malformed input can be rejected per
/// field without failing the whole request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThresholdsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crowd_threshold: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surge_limit: Option<serde_json::Value>,
}

/// One persisted count, as served to dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentCount {
    pub count: u32,

    /// Wall-clock time formatted `HH:MM:SS`
    pub timestamp: String,
}

/// One persisted alert, as served to dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentAlert {
    pub timestamp: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub count: u32,
}
