/// Frame-to-frame crowd movement estimate.
///
/// Each current centroid is paired with its nearest centroid from the previous
/// analyzed frame. This is a one-step correspondence, not a tracker: nothing
/// links a person across more than two frames, and two people passing close
/// to each other can swap partners between steps.
use crate::history::BoundedHistory;
use common::crowd::Centroid;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocitySample {
    /// Mean displacement over matched people, in pixels per analyzed frame
    pub avg: f64,
    /// Largest matched displacement
    pub max: f64,
}

impl VelocitySample {
    pub const ZERO: VelocitySample = VelocitySample { avg: 0.0, max: 0.0 };
}

#[derive(Debug, Clone)]
pub struct VelocityEstimator {
    previous: Vec<Centroid>,
    history: BoundedHistory<f64>,
    match_distance: f64,
}

impl VelocityEstimator {
    pub fn new(match_distance: f64, history_capacity: usize) -> Self {
        Self {
            previous: Vec::new(),
            history: BoundedHistory::new(history_capacity),
            match_distance,
        }
    }

    pub fn estimate(&mut self, current: &[Centroid]) -> VelocitySample {
        if self.previous.is_empty() {
            self.previous = current.to_vec();
            return VelocitySample::ZERO;
        }

        let displacements: Vec<f64> = current
            .iter()
            .filter_map(|c| self.nearest_previous(c))
            .filter(|&d| d < self.match_distance)
            .collect();

        self.previous = current.to_vec();

        if displacements.is_empty() {
            return VelocitySample::ZERO;
        }

        let avg = displacements.iter().sum::<f64>() / displacements.len() as f64;
        let max = displacements.iter().copied().fold(0.0_f64, f64::max);
        self.history.push(avg);

        VelocitySample { avg, max }
    }

    fn nearest_previous(&self, centroid: &Centroid) -> Option<f64> {
        self.previous
            .iter()
            .map(|p| centroid.distance(p))
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn history(&self) -> &BoundedHistory<f64> {
        &self.history
    }

    pub fn previous_positions(&self) -> &[Centroid] {
        &self.previous
    }

    pub fn reset(&mut self) {
        self.previous.clear();
        self.history.clear();
    }
}
