/// Surge and absolute-threshold checks against persisted counts.
///
/// This runs independently of the pattern rules. Its `crowd_surge` compares
/// the two newest persisted counts against the configurable surge limit,
/// whereas the pattern rule looks at a three-sample in-memory window with a
/// fixed delta, so both can fire for the same jump.
use common::crowd::{Alert, AlertKind, AlertOrigin, Severity};
use common::runs::ThresholdsView;

#[derive(Debug, Clone, Copy)]
pub struct SurgeMonitor {
    window: usize,
}

impl Default for SurgeMonitor {
    fn default() -> Self {
        Self::new(5)
    }
}

impl SurgeMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
        }
    }

    /// How many persisted counts the caller should fetch, newest first
    pub fn window(&self) -> usize {
        self.window
    }

    /// `recent` holds persisted counts newest first and should already include
    /// the current frame's count.
    pub fn check(&self, count: u32, recent: &[u32], thresholds: ThresholdsView) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if let [latest, previous, ..] = recent {
            let delta = latest.abs_diff(*previous);
            if i64::from(delta) >= thresholds.surge_limit {
                alerts.push(Alert {
                    kind: AlertKind::CrowdSurge,
                    severity: Severity::Medium,
                    message: format!("Crowd changed by {} people ({} -> {})", delta, previous, latest),
                    count: *latest,
                    delta: Some(delta),
                    origin: AlertOrigin::Monitor,
                });
            }
        }

        if i64::from(count) > thresholds.crowd_threshold {
            alerts.push(Alert {
                kind: AlertKind::CrowdThresholdExceeded,
                severity: Severity::High,
                message: format!(
                    "{} people exceeds threshold {}",
                    count, thresholds.crowd_threshold
                ),
                count,
                delta: None,
                origin: AlertOrigin::Monitor,
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(crowd_threshold: i64, surge_limit: i64) -> ThresholdsView {
        ThresholdsView {
            crowd_threshold,
            surge_limit,
        }
    }

    #[test]
    fn test_needs_two_counts_for_surge() {
        let monitor = SurgeMonitor::default();
        assert!(monitor.check(12, &[12], limits(15, 8)).is_empty());
        assert!(monitor.check(12, &[], limits(15, 8)).is_empty());
    }

    #[test]
    fn test_surge_fires_at_limit_in_either_direction() {
        let monitor = SurgeMonitor::default();

        let up = monitor.check(10, &[10, 2, 0], limits(15, 8));
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].kind, AlertKind::CrowdSurge);
        assert_eq!(up[0].delta, Some(8));
        assert_eq!(up[0].count, 10);
        assert_eq!(up[0].origin, AlertOrigin::Monitor);

        let down = monitor.check(1, &[1, 10], limits(15, 8));
        assert_eq!(down[0].delta, Some(9));

        assert!(monitor.check(9, &[9, 2], limits(15, 8)).is_empty());
    }

    #[test]
    fn test_threshold_boundary() {
        let monitor = SurgeMonitor::default();
        assert!(monitor.check(15, &[15, 15], limits(15, 8)).is_empty());

        let alerts = monitor.check(16, &[16, 15], limits(15, 8));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::CrowdThresholdExceeded);
        assert_eq!(alerts[0].severity, Severity::High);
    }

    #[test]
    fn test_both_checks_can_fire() {
        let monitor = SurgeMonitor::default();
        let alerts = monitor.check(30, &[30, 5], limits(15, 8));
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AlertKind::CrowdSurge, AlertKind::CrowdThresholdExceeded]
        );
    }

    #[test]
    fn test_runtime_limits_are_respected() {
        let monitor = SurgeMonitor::default();
        assert!(monitor.check(4, &[4, 1], limits(15, 8)).is_empty());
        assert_eq!(monitor.check(4, &[4, 1], limits(3, 3)).len(), 2);
    }
}
