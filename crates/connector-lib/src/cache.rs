//! Local snapshot of the last known remote state
//!
//! Every accessor returns a copy: callers never get a reference into the
//! internal collections. Only the synchronizer writes to the cache.

use crate::models::{
    AccountConfig, Agent, AgentConfig, AgentType, Container, GlobalInfo, Metric,
    MetricRegistration, Monitor, RemoteConfigItem, Service,
};
use crate::state::{State, KEY_CACHE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Bumped whenever the persisted layout changes.
pub const CACHE_VERSION: u32 = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheData {
    version: u32,
    #[serde(default)]
    account_id: String,
    #[serde(default)]
    agent: Agent,
    #[serde(default)]
    agents: Vec<Agent>,
    #[serde(default)]
    agent_types: Vec<AgentType>,
    #[serde(default)]
    account_configs: Vec<AccountConfig>,
    #[serde(default)]
    agent_configs: Vec<AgentConfig>,
    #[serde(default)]
    services: Vec<Service>,
    #[serde(default)]
    monitors: Vec<Monitor>,
    #[serde(default)]
    containers: Vec<Container>,
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(default)]
    metric_registrations_fail: Vec<MetricRegistration>,
    #[serde(default)]
    config_items: Vec<RemoteConfigItem>,
    #[serde(default)]
    uploaded_diagnostics: BTreeSet<String>,
    #[serde(default)]
    info: GlobalInfo,
}

/// Last successfully observed remote state
#[derive(Debug)]
pub struct Cache {
    data: RwLock<CacheData>,
    dirty: AtomicBool,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(CacheData {
                version: CACHE_VERSION,
                ..Default::default()
            }),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the cache from the state. An unreadable or outdated cache is discarded.
    pub fn load(state: &State) -> Self {
        let data = match state.get::<CacheData>(KEY_CACHE) {
            Ok(Some(data)) if data.version == CACHE_VERSION => data,
            Ok(Some(data)) => {
                info!(
                    found = data.version,
                    expected = CACHE_VERSION,
                    "Cache version changed, starting with an empty cache"
                );
                return Self::new();
            }
            Ok(None) => return Self::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load the cache, starting with an empty cache");
                return Self::new();
            }
        };

        debug!(
            metrics = data.metrics.len(),
            containers = data.containers.len(),
            "Loaded cache from state"
        );

        Self {
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    /// Persist the cache in the state.
    pub fn save(&self, state: &State) -> Result<()> {
        let data = self.read().clone();
        state.set(KEY_CACHE, &data).context("Failed to save the cache")?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the cache changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheData> {
        self.dirty.store(true, Ordering::SeqCst);
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn account_id(&self) -> String {
        self.read().account_id.clone()
    }

    pub fn set_account_id(&self, account_id: impl Into<String>) {
        self.write().account_id = account_id.into();
    }

    /// The main agent
    pub fn agent(&self) -> Agent {
        self.read().agent.clone()
    }

    pub fn set_agent(&self, agent: Agent) {
        self.write().agent = agent;
    }

    /// All agents of the account visible to this agent
    pub fn agents(&self) -> Vec<Agent> {
        self.read().agents.clone()
    }

    pub fn set_agents(&self, agents: Vec<Agent>) {
        self.write().agents = agents;
    }

    pub fn agent_types(&self) -> Vec<AgentType> {
        self.read().agent_types.clone()
    }

    pub fn set_agent_types(&self, agent_types: Vec<AgentType>) {
        self.write().agent_types = agent_types;
    }

    pub fn agent_type_by_name(&self, name: &str) -> Option<AgentType> {
        self.read().agent_types.iter().find(|t| t.name == name).cloned()
    }

    pub fn account_configs(&self) -> Vec<AccountConfig> {
        self.read().account_configs.clone()
    }

    pub fn set_account_configs(&self, configs: Vec<AccountConfig>) {
        self.write().account_configs = configs;
    }

    pub fn agent_configs(&self) -> Vec<AgentConfig> {
        self.read().agent_configs.clone()
    }

    pub fn set_agent_configs(&self, configs: Vec<AgentConfig>) {
        self.write().agent_configs = configs;
    }

    /// Account configuration currently assigned to the main agent
    pub fn current_account_config(&self) -> Option<AccountConfig> {
        let data = self.read();
        let id = &data.agent.current_config_id;
        if id.is_empty() {
            return None;
        }

        data.account_configs.iter().find(|c| &c.id == id).cloned()
    }

    /// Agent configuration of the current account config for an agent type name.
    pub fn agent_config_for_type(&self, agent_type_name: &str) -> Option<AgentConfig> {
        let data = self.read();
        let agent_type = data.agent_types.iter().find(|t| t.name == agent_type_name)?;

        data.agent_configs
            .iter()
            .find(|c| {
                c.agent_type_id == agent_type.id && c.account_config_id == data.agent.current_config_id
            })
            .cloned()
    }

    pub fn services(&self) -> Vec<Service> {
        self.read().services.clone()
    }

    pub fn set_services(&self, services: Vec<Service>) {
        self.write().services = services;
    }

    pub fn services_by_uuid(&self) -> HashMap<String, Service> {
        self.read()
            .services
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect()
    }

    pub fn monitors(&self) -> Vec<Monitor> {
        self.read().monitors.clone()
    }

    pub fn set_monitors(&self, monitors: Vec<Monitor>) {
        self.write().monitors = monitors;
    }

    pub fn containers(&self) -> Vec<Container> {
        self.read().containers.clone()
    }

    pub fn set_containers(&self, containers: Vec<Container>) {
        self.write().containers = containers;
    }

    pub fn containers_by_uuid(&self) -> HashMap<String, Container> {
        self.read()
            .containers
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect()
    }

    /// Containers keyed by name. Names are stable across container replacement.
    pub fn containers_by_name(&self) -> HashMap<String, Container> {
        self.read()
            .containers
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.read().metrics.clone()
    }

    /// Replace the metrics. The earliest known `first_seen_at` of a metric is kept.
    pub fn set_metrics(&self, metrics: Vec<Metric>) {
        let mut data = self.write();

        let previous: HashMap<String, Option<chrono::DateTime<chrono::Utc>>> = data
            .metrics
            .iter()
            .map(|m| (m.id.clone(), m.first_seen_at))
            .collect();

        let merged = metrics
            .into_iter()
            .map(|mut metric| {
                if let Some(Some(old)) = previous.get(&metric.id) {
                    metric.first_seen_at = match metric.first_seen_at {
                        Some(new) if new <= *old => Some(new),
                        _ => Some(*old),
                    };
                }
                metric
            })
            .collect();

        data.metrics = merged;
    }

    /// Insert or replace metrics by ID.
    pub fn upsert_metrics(&self, metrics: Vec<Metric>) {
        if metrics.is_empty() {
            return;
        }

        let mut by_id = self.metrics_by_uuid();
        for metric in metrics {
            by_id.insert(metric.id.clone(), metric);
        }

        let mut merged: Vec<Metric> = by_id.into_values().collect();
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        self.set_metrics(merged);
    }

    pub fn delete_metrics(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }

        self.write().metrics.retain(|m| !ids.contains(&m.id));
    }

    pub fn metrics_by_uuid(&self) -> HashMap<String, Metric> {
        self.read()
            .metrics
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect()
    }

    /// Metrics keyed by their labels text
    pub fn metrics_by_labels(&self) -> HashMap<String, Metric> {
        self.read()
            .metrics
            .iter()
            .map(|m| (m.labels_text.clone(), m.clone()))
            .collect()
    }

    pub fn metric_registrations_fail(&self) -> Vec<MetricRegistration> {
        self.read().metric_registrations_fail.clone()
    }

    pub fn set_metric_registrations_fail(&self, registrations: Vec<MetricRegistration>) {
        self.write().metric_registrations_fail = registrations;
    }

    pub fn config_items(&self) -> Vec<RemoteConfigItem> {
        self.read().config_items.clone()
    }

    pub fn set_config_items(&self, items: Vec<RemoteConfigItem>) {
        self.write().config_items = items;
    }

    pub fn info(&self) -> GlobalInfo {
        self.read().info.clone()
    }

    pub fn set_info(&self, info: GlobalInfo) {
        self.write().info = info;
    }

    pub fn uploaded_diagnostics(&self) -> BTreeSet<String> {
        self.read().uploaded_diagnostics.clone()
    }

    pub fn mark_diagnostic_uploaded(&self, name: impl Into<String>) {
        self.write().uploaded_diagnostics.insert(name.into());
    }

    /// Short human readable summary used in diagnostic archives.
    pub fn summary(&self) -> String {
        let data = self.read();
        let active = data.metrics.iter().filter(|m| m.is_active()).count();

        format!(
            "version: {}\naccount: {}\nagent: {} ({})\nagents: {}\nagent types: {}\n\
             account configs: {}\nagent configs: {}\nservices: {}\nmonitors: {}\n\
             containers: {}\nmetrics: {} ({} active)\nregistration failures: {}\n\
             config items: {}\nuploaded diagnostics: {}\nmaintenance: {}\n",
            data.version,
            data.account_id,
            data.agent.id,
            data.agent.fqdn,
            data.agents.len(),
            data.agent_types.len(),
            data.account_configs.len(),
            data.agent_configs.len(),
            data.services.len(),
            data.monitors.len(),
            data.containers.len(),
            data.metrics.len(),
            active,
            data.metric_registrations_fail.len(),
            data.config_items.len(),
            data.uploaded_diagnostics.len(),
            data.info.maintenance,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn metric(id: &str, first_seen_hour: u32) -> Metric {
        Metric {
            id: id.to_string(),
            agent_id: "agent-1".to_string(),
            labels_text: format!("__name__=\"metric_{}\"", id),
            first_seen_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, first_seen_hour, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_metrics_keeps_earliest_first_seen() {
        let cache = Cache::new();
        cache.set_metrics(vec![metric("1", 8), metric("2", 12)]);

        cache.set_metrics(vec![metric("1", 10), metric("2", 9), metric("3", 11)]);

        let by_uuid = cache.metrics_by_uuid();
        assert_eq!(by_uuid["1"].first_seen_at.unwrap().format("%H").to_string(), "08");
        assert_eq!(by_uuid["2"].first_seen_at.unwrap().format("%H").to_string(), "09");
        assert_eq!(by_uuid["3"].first_seen_at.unwrap().format("%H").to_string(), "11");
    }

    #[test]
    fn test_set_metrics_keeps_cached_first_seen_when_remote_has_none() {
        let cache = Cache::new();
        cache.set_metrics(vec![metric("1", 8)]);

        let mut updated = metric("1", 8);
        updated.first_seen_at = None;
        cache.set_metrics(vec![updated]);

        assert!(cache.metrics_by_uuid()["1"].first_seen_at.is_some());
    }

    #[test]
    fn test_upsert_and_delete_metrics() {
        let cache = Cache::new();
        cache.set_metrics(vec![metric("1", 8), metric("2", 9)]);

        let mut updated = metric("2", 12);
        updated.deactivated_at = Some(Utc::now());
        cache.upsert_metrics(vec![updated, metric("3", 10)]);

        let by_uuid = cache.metrics_by_uuid();
        assert_eq!(by_uuid.len(), 3);
        assert!(!by_uuid["2"].is_active());
        assert_eq!(by_uuid["2"].first_seen_at.unwrap().format("%H").to_string(), "09");

        cache.delete_metrics(&["1".to_string(), "unknown".to_string()]);
        assert_eq!(cache.metrics().len(), 2);
        assert!(!cache.metrics_by_uuid().contains_key("1"));
    }

    #[test]
    fn test_accessors_return_copies() {
        let cache = Cache::new();
        cache.set_metrics(vec![metric("1", 8)]);

        let mut copy = cache.metrics();
        copy[0].deactivated_at = Some(Utc::now());
        copy.push(metric("2", 9));

        let stored = cache.metrics();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_active());
    }

    #[test]
    fn test_current_account_config() {
        let cache = Cache::new();
        cache.set_account_configs(vec![AccountConfig {
            id: "cfg-1".to_string(),
            name: "default".to_string(),
            ..Default::default()
        }]);
        assert!(cache.current_account_config().is_none());

        cache.set_agent(Agent {
            id: "agent-1".to_string(),
            current_config_id: "cfg-1".to_string(),
            ..Default::default()
        });
        assert_eq!(cache.current_account_config().unwrap().name, "default");
    }

    #[test]
    fn test_cache_survives_save_and_load() {
        let dir = TempDir::new().unwrap();
        let state = State::load(dir.path().join("state.json")).unwrap();

        let cache = Cache::new();
        cache.set_account_id("account-1");
        cache.set_metrics(vec![metric("1", 8)]);
        cache.mark_diagnostic_uploaded("crash-1.zip");
        assert!(cache.is_dirty());
        cache.save(&state).unwrap();
        assert!(!cache.is_dirty());

        let state = State::load(dir.path().join("state.json")).unwrap();
        let loaded = Cache::load(&state);
        assert_eq!(loaded.account_id(), "account-1");
        assert_eq!(loaded.metrics().len(), 1);
        assert!(loaded.uploaded_diagnostics().contains("crash-1.zip"));
    }

    #[test]
    fn test_outdated_cache_is_discarded() {
        let state = State::in_memory();
        state
            .set(
                KEY_CACHE,
                &serde_json::json!({"version": CACHE_VERSION - 1, "account_id": "old"}),
            )
            .unwrap();

        let cache = Cache::load(&state);
        assert_eq!(cache.account_id(), "");
    }

    #[test]
    fn test_containers_indexed_by_name() {
        let cache = Cache::new();
        cache.set_containers(vec![Container {
            id: "uuid-1".to_string(),
            name: "web".to_string(),
            container_id: "abc".to_string(),
            last_updated_at: Some(Utc::now() - Duration::minutes(5)),
            ..Default::default()
        }]);

        assert_eq!(cache.containers_by_name()["web"].id, "uuid-1");
        assert_eq!(cache.containers_by_uuid()["uuid-1"].container_id, "abc");
    }
}
