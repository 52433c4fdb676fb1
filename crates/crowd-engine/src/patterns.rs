/// Pattern rules over velocity, density zones and the short count history
use crate::config::EngineConfig;
use crate::grid::Zone;
use crate::history::BoundedHistory;
use crate::velocity::VelocitySample;
use common::crowd::{Alert, AlertKind, AlertOrigin, Severity};

#[derive(Debug, Clone)]
pub struct PatternAlertEngine {
    count_history: BoundedHistory<u32>,
    velocity_threshold: f64,
    panic_velocity_threshold: f64,
    surge_window: usize,
    surge_window_delta: i64,
}

impl PatternAlertEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            count_history: BoundedHistory::new(config.history_capacity),
            velocity_threshold: config.velocity_threshold,
            panic_velocity_threshold: config.panic_velocity_threshold,
            surge_window: config.surge_window,
            surge_window_delta: config.surge_window_delta,
        }
    }

    /// Record `count` and evaluate every rule. Alerts come back in rule order.
    pub fn evaluate(&mut self, velocity: VelocitySample, zones: &[Zone], count: u32) -> Vec<Alert> {
        self.count_history.push(count);
        let mut alerts = Vec::new();

        // Panic and stampede risk are exclusive: panic wins.
        if velocity.avg > self.panic_velocity_threshold {
            alerts.push(pattern_alert(
                AlertKind::PanicMovement,
                Severity::Critical,
                format!("PANIC! Avg velocity {:.1}", velocity.avg),
                count,
            ));
        } else if velocity.avg > self.velocity_threshold && !zones.is_empty() {
            alerts.push(pattern_alert(
                AlertKind::StampedeRisk,
                Severity::High,
                format!("Fast movement in {} dense zones", zones.len()),
                count,
            ));
        }

        let critical = zones.iter().filter(|z| z.is_critical()).count();
        if critical > 0 {
            alerts.push(pattern_alert(
                AlertKind::CriticalDensity,
                Severity::High,
                format!("{} critical crowd zones", critical),
                count,
            ));
        }

        if let Some(growth) = self.window_growth() {
            if growth > self.surge_window_delta {
                alerts.push(pattern_alert(
                    AlertKind::CrowdSurge,
                    Severity::Medium,
                    format!("Sudden surge +{} people", growth),
                    count,
                ));
            }
        }

        alerts
    }

    /// Newest minus oldest count of the surge window
    fn window_growth(&self) -> Option<i64> {
        let window = self.count_history.tail(self.surge_window)?;
        let oldest = *window.first()?;
        let newest = *window.last()?;
        Some(i64::from(newest) - i64::from(oldest))
    }

    pub fn count_history(&self) -> &BoundedHistory<u32> {
        &self.count_history
    }

    pub fn reset(&mut self) {
        self.count_history.clear();
    }
}

fn pattern_alert(kind: AlertKind, severity: Severity, message: String, count: u32) -> Alert {
    Alert {
        kind,
        severity,
        message,
        count,
        delta: None,
        origin: AlertOrigin::Pattern,
    }
}
