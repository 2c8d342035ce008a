//! Synchronizer configuration

use crate::models::{ConfigItem, MetricFormat};
use std::time::Duration;

/// Configuration of the synchronizer
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Account the agent registers in
    pub account_id: String,
    /// Account registration key, only used until the agent is registered
    pub registration_key: String,
    pub fqdn: String,
    pub display_name: String,
    /// Tags set on the agent
    pub tags: Vec<String>,
    /// Version compared with the minimum version the API supports
    pub agent_version: String,
    pub metric_format: MetricFormat,
    /// Scraper name of the blackbox prober; its metrics are owned by this agent
    pub blackbox_scraper_name: String,
    /// Effective local configuration, reconciled with the API
    pub config_items: Vec<ConfigItem>,
    /// Interval between full synchronizations (default: 1 hour)
    pub full_sync_interval: Duration,
    /// Maximum random delay added to the full sync interval (default: 5 minutes)
    pub full_sync_jitter: Duration,
    /// Minimum delay between two passes (default: 15 seconds)
    pub min_delay_between_passes: Duration,
    /// Maximum metric registrations per pass (default: 1000)
    pub metric_registration_budget: usize,
    /// Delay before an unseen metric is deactivated (default: 70 minutes)
    pub metric_deactivation_grace: Duration,
    /// Unknown registration failures retried before waiting for a full sync (default: 5)
    pub unknown_failure_max_retries: u32,
    /// Age of a container before it is registered (default: 30 seconds)
    pub container_registration_delay: Duration,
    /// Minimum delay between two updates of an unchanged container (default: 30 minutes)
    pub container_update_delay: Duration,
    /// Disable duration when the agent version is unsupported (default: 1 day)
    pub too_old_disable: Duration,
    /// Disable duration when the local clock drifts (default: 15 minutes)
    pub time_drift_disable: Duration,
    /// Largest diagnostic archive uploaded (default: 5 MB)
    pub max_diagnostic_size: u64,
    /// Upper bound of the error backoff (default: 15 minutes)
    pub max_error_backoff: Duration,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            registration_key: String::new(),
            fqdn: String::new(),
            display_name: String::new(),
            tags: Vec::new(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            metric_format: MetricFormat::Bleemeo,
            blackbox_scraper_name: String::new(),
            config_items: Vec::new(),
            full_sync_interval: Duration::from_secs(3600),
            full_sync_jitter: Duration::from_secs(300),
            min_delay_between_passes: Duration::from_secs(15),
            metric_registration_budget: 1000,
            metric_deactivation_grace: Duration::from_secs(70 * 60),
            unknown_failure_max_retries: 5,
            container_registration_delay: Duration::from_secs(30),
            container_update_delay: Duration::from_secs(30 * 60),
            too_old_disable: Duration::from_secs(24 * 3600),
            time_drift_disable: Duration::from_secs(15 * 60),
            max_diagnostic_size: 5 * 1024 * 1024,
            max_error_backoff: Duration::from_secs(15 * 60),
        }
    }
}

/// Convert to a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
