//! Observability infrastructure for the connector
//!
//! Provides:
//! - Prometheus metrics (API requests, synchronization passes, registration
//!   failures, cache size, MQTT restarts)
//! - Structured JSON logging of connector lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for a synchronization pass (in seconds)
const SYNC_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static GLOBAL_METRICS: OnceLock<SyncMetricsInner> = OnceLock::new();

struct SyncMetricsInner {
    api_requests: IntCounterVec,
    sync_runs: IntCounterVec,
    sync_duration_seconds: Histogram,
    entity_errors: IntCounterVec,
    registration_failures: IntCounterVec,
    cached_entities: IntGaugeVec,
    successive_errors: IntGauge,
    disabled: IntGauge,
    mqtt_restarts: IntCounterVec,
}

impl SyncMetricsInner {
    fn new() -> Self {
        Self {
            api_requests: register_int_counter_vec!(
                "bleemeo_connector_api_requests_total",
                "Requests sent to the Bleemeo API",
                &["method", "status"]
            )
            .expect("Failed to register api_requests"),

            sync_runs: register_int_counter_vec!(
                "bleemeo_connector_sync_runs_total",
                "Synchronization passes by result",
                &["result"]
            )
            .expect("Failed to register sync_runs"),

            sync_duration_seconds: register_histogram!(
                "bleemeo_connector_sync_duration_seconds",
                "Duration of a synchronization pass",
                SYNC_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register sync_duration_seconds"),

            entity_errors: register_int_counter_vec!(
                "bleemeo_connector_entity_errors_total",
                "Synchronization errors by entity",
                &["entity"]
            )
            .expect("Failed to register entity_errors"),

            registration_failures: register_int_counter_vec!(
                "bleemeo_connector_metric_registration_failures_total",
                "Metric registrations refused by the API",
                &["kind"]
            )
            .expect("Failed to register registration_failures"),

            cached_entities: register_int_gauge_vec!(
                "bleemeo_connector_cached_entities",
                "Number of entities in the local cache",
                &["entity"]
            )
            .expect("Failed to register cached_entities"),

            successive_errors: register_int_gauge!(
                "bleemeo_connector_successive_errors",
                "Failed synchronization passes since the last success"
            )
            .expect("Failed to register successive_errors"),

            disabled: register_int_gauge!(
                "bleemeo_connector_disabled",
                "1 while synchronization is disabled"
            )
            .expect("Failed to register disabled"),

            mqtt_restarts: register_int_counter_vec!(
                "bleemeo_connector_mqtt_restarts_total",
                "MQTT client restarts by cause",
                &["cause"]
            )
            .expect("Failed to register mqtt_restarts"),
        }
    }
}

/// Connector metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share
/// the same underlying metrics.
#[derive(Clone)]
pub struct SyncMetrics {
    _private: (),
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SyncMetricsInner {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new)
    }

    pub fn inc_api_request(&self, method: &str, status: u16) {
        self.inner()
            .api_requests
            .with_label_values(&[method, &status.to_string()])
            .inc();
    }

    /// Record a finished pass
    pub fn observe_sync(&self, success: bool, duration_secs: f64) {
        let result = if success { "success" } else { "error" };
        self.inner().sync_runs.with_label_values(&[result]).inc();
        self.inner().sync_duration_seconds.observe(duration_secs);
    }

    pub fn inc_entity_error(&self, entity: &str) {
        self.inner().entity_errors.with_label_values(&[entity]).inc();
    }

    pub fn inc_registration_failure(&self, kind: &str) {
        self.inner()
            .registration_failures
            .with_label_values(&[kind])
            .inc();
    }

    pub fn set_cached(&self, entity: &str, count: usize) {
        self.inner()
            .cached_entities
            .with_label_values(&[entity])
            .set(count as i64);
    }

    pub fn set_successive_errors(&self, count: u32) {
        self.inner().successive_errors.set(count as i64);
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.inner().disabled.set(disabled as i64);
    }

    pub fn inc_mqtt_restart(&self, cause: &str) {
        self.inner().mqtt_restarts.with_label_values(&[cause]).inc();
    }
}

/// Structured logger for connector lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    agent_id: String,
}

impl StructuredLogger {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "connector_started",
            agent_id = %self.agent_id,
            agent_version = %version,
            "Bleemeo connector started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "connector_shutdown",
            agent_id = %self.agent_id,
            reason = %reason,
            "Bleemeo connector shutting down"
        );
    }

    /// Log the outcome of the agent registration
    pub fn log_registration(&self, account_id: &str, fqdn: &str) {
        info!(
            event = "agent_registered",
            agent_id = %self.agent_id,
            account_id = %account_id,
            fqdn = %fqdn,
            "Agent registered on the Bleemeo API"
        );
    }

    pub fn log_sync_completed(&self, entities: &[&str], full: bool, duration_ms: u64, errors: usize) {
        if errors == 0 {
            info!(
                event = "sync_completed",
                agent_id = %self.agent_id,
                entities = ?entities,
                full = full,
                duration_ms = duration_ms,
                "Synchronization pass completed"
            );
        } else {
            warn!(
                event = "sync_completed",
                agent_id = %self.agent_id,
                entities = ?entities,
                full = full,
                duration_ms = duration_ms,
                errors = errors,
                "Synchronization pass completed with errors"
            );
        }
    }

    pub fn log_disabled(&self, reason: &str, until: &str) {
        warn!(
            event = "sync_disabled",
            agent_id = %self.agent_id,
            reason = %reason,
            until = %until,
            "Synchronization with the Bleemeo API disabled"
        );
    }

    pub fn log_mqtt_restart(&self, cause: &str, restarts: u32) {
        warn!(
            event = "mqtt_restart",
            agent_id = %self.agent_id,
            cause = %cause,
            restarts = restarts,
            "Restarting the MQTT client"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_metrics_handles_share_registry() {
        let metrics = SyncMetrics::new();
        let other = metrics.clone();

        metrics.inc_api_request("GET", 200);
        other.inc_api_request("GET", 200);
        metrics.observe_sync(true, 0.5);
        metrics.inc_entity_error("metric");
        metrics.inc_registration_failure("not-allowed");
        metrics.set_cached("metric", 12);
        metrics.set_successive_errors(2);
        metrics.set_disabled(false);
        metrics.inc_mqtt_restart("no_report");

        let families = prometheus::gather();
        let requests = families
            .iter()
            .find(|f| f.get_name() == "bleemeo_connector_api_requests_total")
            .unwrap();
        assert!(!requests.get_metric().is_empty());
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("agent-1");
        assert_eq!(logger.agent_id, "agent-1");
    }
}
