//! Callbacks from the synchronizer into the agent

use chrono::{DateTime, Utc};
use connector_lib::models::{DisableReason, Metric};
use connector_lib::synchronizer::ScheduledMonitor;
use connector_lib::SynchronizerHooks;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// Keeps what the agent needs to know from the API and logs the changes.
#[derive(Default)]
pub struct AgentHooks {
    initialized: AtomicBool,
    maintenance: AtomicBool,
    thresholds: AtomicUsize,
    monitors: Mutex<Vec<ScheduledMonitor>>,
}

impl AgentHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    /// Metrics with at least one threshold set
    pub fn thresholds_count(&self) -> usize {
        self.thresholds.load(Ordering::SeqCst)
    }

    pub fn monitors(&self) -> Vec<ScheduledMonitor> {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SynchronizerHooks for AgentHooks {
    fn update_config(&self, name_changed: bool) {
        info!(name_changed, "Account configuration changed");
    }

    fn disable(&self, reason: DisableReason, until: DateTime<Utc>) {
        warn!(reason = %reason, until = %until.to_rfc3339(), "Connection to Bleemeo disabled");
    }

    fn set_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn set_maintenance(&self, maintenance: bool) {
        if self.maintenance.swap(maintenance, Ordering::SeqCst) != maintenance {
            info!(maintenance, "Maintenance mode changed");
        }
    }

    fn update_thresholds(&self, metrics: &[Metric]) {
        let count = metrics.iter().filter(|m| !m.threshold.is_zero()).count();
        self.thresholds.store(count, Ordering::SeqCst);
    }

    fn update_monitors(&self, monitors: &[ScheduledMonitor]) {
        info!(count = monitors.len(), "Monitors updated");
        *self.monitors.lock().unwrap_or_else(|e| e.into_inner()) = monitors.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintenance_and_initialization() {
        let hooks = AgentHooks::new();
        assert!(!hooks.is_initialized());

        hooks.set_initialized();
        hooks.set_maintenance(true);

        assert!(hooks.is_initialized());
        assert!(hooks.is_maintenance());
        assert!(!hooks.is_mqtt_connected());
    }

    #[test]
    fn test_thresholds_count_ignores_empty_thresholds() {
        let hooks = AgentHooks::new();
        let mut with_threshold = Metric::default();
        with_threshold.threshold.high_warning = Some(80.0);

        hooks.update_thresholds(&[with_threshold, Metric::default()]);

        assert_eq!(hooks.thresholds_count(), 1);
    }
}
