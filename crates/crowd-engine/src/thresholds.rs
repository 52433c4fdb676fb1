use common::runs::{ThresholdsUpdate, ThresholdsView};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CROWD_THRESHOLD: i64 = 15;
pub const DEFAULT_SURGE_LIMIT: i64 = 8;

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("{field} must be an integer, got {value}")]
    NotAnInteger { field: &'static str, value: String },

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },
}

/// Runtime-adjustable alert thresholds.
///
/// Clones share the same values. Writers and the pipeline never block each
/// other; a reader sees the latest completed write.
#[derive(Debug, Clone)]
pub struct Thresholds {
    crowd_threshold: Arc<AtomicI64>,
    surge_limit: Arc<AtomicI64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(DEFAULT_CROWD_THRESHOLD, DEFAULT_SURGE_LIMIT)
    }
}

impl Thresholds {
    pub fn new(crowd_threshold: i64, surge_limit: i64) -> Self {
        Self {
            crowd_threshold: Arc::new(AtomicI64::new(crowd_threshold)),
            surge_limit: Arc::new(AtomicI64::new(surge_limit)),
        }
    }

    pub fn crowd_threshold(&self) -> i64 {
        self.crowd_threshold.load(Ordering::Relaxed)
    }

    pub fn surge_limit(&self) -> i64 {
        self.surge_limit.load(Ordering::Relaxed)
    }

    pub fn set_crowd_threshold(&self, value: i64) {
        self.crowd_threshold.store(value, Ordering::Relaxed);
        info!(crowd_threshold = value, "updated crowd threshold");
    }

    pub fn set_surge_limit(&self, value: i64) {
        self.surge_limit.store(value, Ordering::Relaxed);
        info!(surge_limit = value, "updated surge limit");
    }

    pub fn snapshot(&self) -> ThresholdsView {
        ThresholdsView {
            crowd_threshold: self.crowd_threshold(),
            surge_limit: self.surge_limit(),
        }
    }

    /// Apply a partial update. Every supplied field is validated before any
    /// is written, so a rejected request leaves both values unchanged.
    pub fn apply(&self, update: &ThresholdsUpdate) -> Result<ThresholdsView, ThresholdError> {
        let crowd = update
            .crowd_threshold
            .as_ref()
            .map(|v| parse_threshold("crowd_threshold", v))
            .transpose();
        let surge = update
            .surge_limit
            .as_ref()
            .map(|v| parse_threshold("surge_limit", v))
            .transpose();

        let (crowd, surge) = match (crowd, surge) {
            (Ok(crowd), Ok(surge)) => (crowd, surge),
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        if let Some(value) = crowd {
            self.set_crowd_threshold(value);
        }
        if let Some(value) = surge {
            self.set_surge_limit(value);
        }

        Ok(self.snapshot())
    }
}

/// Accept JSON integers, integral floats and integer strings ("20", " 7 ").
pub fn parse_threshold(field: &'static str, value: &serde_json::Value) -> Result<i64, ThresholdError> {
    let not_an_integer = || ThresholdError::NotAnInteger {
        field,
        value: value.to_string(),
    };

    let parsed = match value {
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    f as i64
                }
                _ => return Err(not_an_integer()),
            },
        },
        serde_json::Value::String(s) => s.trim().parse::<i64>().map_err(|_| not_an_integer())?,
        _ => return Err(not_an_integer()),
    };

    if parsed < 0 {
        return Err(ThresholdError::Negative {
            field,
            value: parsed,
        });
    }

    Ok(parsed)
}
