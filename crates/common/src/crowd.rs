//! Crowd analytics contracts shared by the engine and the service.
//!
//! These types cross crate boundaries and go out on the wire to dashboards,
//! so their serde representation is part of the public contract.

use serde::{Deserialize, Serialize};

/// Nominal area used to turn a head count into the density proxy.
pub const DENSITY_AREA: f64 = 100.0;

/// Centre point of a detected person, in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Centroid {
    pub x: i32,
    pub y: i32,
}

impl Centroid {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another centroid
    pub fn distance(&self, other: &Centroid) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        dx.hypot(dy)
    }
}

impl From<(i32, i32)> for Centroid {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// Bounding box coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Integer centre of the box, truncated the same way for every detector
    pub fn center(&self) -> Centroid {
        Centroid {
            x: (self.x + self.width / 2.0) as i32,
            y: (self.y + self.height / 2.0) as i32,
        }
    }
}

/// A person detection produced by a model adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonDetection {
    /// Bounding box in frame pixel coordinates
    pub bbox: BoundingBox,

    /// Detection confidence (0.0 to 1.0)
    pub confidence: f32,
}

/// Alert severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PanicMovement,
    StampedeRisk,
    CriticalDensity,
    CrowdSurge,
    CrowdThresholdExceeded,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::PanicMovement => "panic_movement",
            AlertKind::StampedeRisk => "stampede_risk",
            AlertKind::CriticalDensity => "critical_density",
            AlertKind::CrowdSurge => "crowd_surge",
            AlertKind::CrowdThresholdExceeded => "crowd_threshold_exceeded",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "panic_movement" => Ok(AlertKind::PanicMovement),
            "stampede_risk" => Ok(AlertKind::StampedeRisk),
            "critical_density" => Ok(AlertKind::CriticalDensity),
            "crowd_surge" => Ok(AlertKind::CrowdSurge),
            "crowd_threshold_exceeded" => Ok(AlertKind::CrowdThresholdExceeded),
            _ => Err(format!("Invalid alert type: {}", s)),
        }
    }
}

/// Which producer raised an alert.
///
/// `crowd_surge` has two producers with different windows, so consumers
/// need this to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOrigin {
    /// In-memory pattern rules over velocity, zones and the short count history
    Pattern,
    /// Persisted-count surge check and the absolute crowd threshold
    Monitor,
}

impl AlertOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertOrigin::Pattern => "pattern",
            AlertOrigin::Monitor => "monitor",
        }
    }
}

/// A crowd-safety alert. Immutable once raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,

    pub severity: Severity,

    /// Human-readable summary for operators
    pub message: String,

    /// Person count of the frame that raised the alert
    pub count: u32,

    /// Count change that triggered a monitor surge alert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<u32>,

    pub origin: AlertOrigin,
}

/// Per-frame count output, emitted for every analyzed frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountUpdate {
    pub count: u32,

    /// `count / 100`, rounded to two decimals
    pub density: f64,
}

impl CountUpdate {
    pub fn new(count: u32) -> Self {
        let density = f64::from(count) / DENSITY_AREA;
        Self {
            count,
            density: (density * 100.0).round() / 100.0,
        }
    }
}

/// Events pushed to live clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum CrowdEvent {
    /// Alert from the pattern rules
    StampedeAlert(Alert),
    /// Alert from the surge/threshold monitor
    AlertEvent(Alert),
    CrowdUpdate(CountUpdate),
}

impl CrowdEvent {
    /// Wrap an alert in the event matching its producer
    pub fn from_alert(alert: Alert) -> Self {
        match alert.origin {
            AlertOrigin::Pattern => CrowdEvent::StampedeAlert(alert),
            AlertOrigin::Monitor => CrowdEvent::AlertEvent(alert),
        }
    }
}
