//! Agent configuration
//!
//! Values come from built-in defaults, an optional configuration file and
//! `AGENT_` environment variables, in increasing order of precedence. Each
//! effective value is also reported as a config item tagged with the layer
//! that set it.

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use connector_lib::client::ClientConfig;
use connector_lib::discovery::LocalService;
use connector_lib::models::{ConfigItem, ConfigItemSource, ConfigItemType, MetricFormat};
use connector_lib::{ConnectorConfig, SynchronizerConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "AGENT_CONFIG_FILE";

/// Configuration file used when `AGENT_CONFIG_FILE` is unset, any supported extension
pub const DEFAULT_CONFIG_FILE: &str = "/etc/monitoring-agent/agent";

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// API server port for health/metrics
    pub api_port: u16,

    /// File holding the agent credentials and the cache
    pub state_file: String,

    /// Directory where crash reports are written
    pub crash_report_dir: String,

    pub tags: Vec<String>,

    pub fqdn: String,

    pub display_name: String,

    /// "bleemeo" or "prometheus"
    pub metric_format: String,

    /// Scraper name of the blackbox prober running with this agent
    pub blackbox_scraper_name: String,

    /// Services reported to the API
    pub services: Vec<LocalService>,

    pub bleemeo: BleemeoConfig,

    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleemeoConfig {
    pub account_id: String,
    pub registration_key: String,
    pub api_base: String,
    pub mqtt_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub full_sync_interval_secs: u64,
    pub metric_registration_budget: usize,
    pub container_registration_delay_secs: u64,
    pub metric_deactivation_grace_secs: u64,
    pub unknown_failure_max_retries: u32,
}

/// Configuration and the config items describing it
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AgentConfig,
    pub items: Vec<ConfigItem>,
}

fn default_fqdn() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn defaults() -> Result<ConfigBuilder<DefaultState>> {
    let sync = SynchronizerConfig::default();

    Ok(Config::builder()
        .set_default("api_port", 8015)?
        .set_default("state_file", "/var/lib/monitoring-agent/state.json")?
        .set_default("crash_report_dir", "/var/lib/monitoring-agent/crash_reports")?
        .set_default("tags", Vec::<String>::new())?
        .set_default("fqdn", default_fqdn())?
        .set_default("display_name", "")?
        .set_default("metric_format", "bleemeo")?
        .set_default("blackbox_scraper_name", "")?
        .set_default("services", Vec::<String>::new())?
        .set_default("bleemeo.account_id", "")?
        .set_default("bleemeo.registration_key", "")?
        .set_default("bleemeo.api_base", ClientConfig::default().api_base)?
        .set_default("bleemeo.mqtt_enabled", true)?
        .set_default("sync.full_sync_interval_secs", sync.full_sync_interval.as_secs())?
        .set_default("sync.metric_registration_budget", sync.metric_registration_budget as u64)?
        .set_default(
            "sync.container_registration_delay_secs",
            sync.container_registration_delay.as_secs(),
        )?
        .set_default(
            "sync.metric_deactivation_grace_secs",
            sync.metric_deactivation_grace.as_secs(),
        )?
        .set_default("sync.unknown_failure_max_retries", sync.unknown_failure_max_retries as u64)?)
}

/// Environment source reading `AGENT_SECTION__KEY` variables.
pub fn environment() -> Environment {
    Environment::with_prefix("AGENT")
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("tags")
        .try_parsing(true)
}

/// Flatten nested tables into dotted keys. Lists are kept whole.
fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        Value::Object(_) if prefix.is_empty() => {}
        _ => {
            out.insert(prefix.to_string(), value.clone());
        }
    }
}

fn layer_values(builder: ConfigBuilder<DefaultState>) -> Result<BTreeMap<String, Value>> {
    let value: Value = builder.build()?.try_deserialize()?;
    let mut out = BTreeMap::new();
    flatten("", &value, &mut out);
    Ok(out)
}

/// Priority of a layer; later layers win.
fn priority(source: ConfigItemSource) -> i32 {
    match source {
        ConfigItemSource::Unknown | ConfigItemSource::Default => 0,
        ConfigItemSource::File => 1,
        ConfigItemSource::Env => 2,
    }
}

impl AgentConfig {
    /// Load configuration from the file named by `AGENT_CONFIG_FILE` and the environment
    pub fn load() -> Result<LoadedConfig> {
        let file = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&file, environment())
    }

    pub fn load_from(file: &str, env: Environment) -> Result<LoadedConfig> {
        let config: AgentConfig = defaults()?
            .add_source(File::with_name(file).required(false))
            .add_source(env.clone())
            .build()
            .with_context(|| format!("Failed to read configuration from {} and environment", file))?
            .try_deserialize()
            .context("Invalid configuration")?;

        let layers = [
            (ConfigItemSource::Default, "", layer_values(defaults()?)?),
            (
                ConfigItemSource::File,
                file,
                layer_values(Config::builder().add_source(File::with_name(file).required(false)))?,
            ),
            (ConfigItemSource::Env, "", layer_values(Config::builder().add_source(env))?),
        ];

        let mut items: BTreeMap<String, ConfigItem> = BTreeMap::new();
        for (source, path, values) in layers {
            for (key, value) in values {
                items.insert(
                    key.clone(),
                    ConfigItem {
                        key,
                        item_type: ConfigItemType::of(&value),
                        value,
                        priority: priority(source),
                        source,
                        path: path.to_string(),
                    },
                );
            }
        }

        Ok(LoadedConfig {
            config,
            items: items.into_values().collect(),
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_base: self.bleemeo.api_base.clone(),
            ..Default::default()
        }
    }

    pub fn connector_config(&self, items: Vec<ConfigItem>) -> Result<ConnectorConfig> {
        let metric_format: MetricFormat = self.metric_format.parse().context("Invalid metric_format")?;

        let synchronizer = SynchronizerConfig {
            account_id: self.bleemeo.account_id.clone(),
            registration_key: self.bleemeo.registration_key.clone(),
            fqdn: self.fqdn.clone(),
            display_name: self.display_name.clone(),
            tags: self.tags.clone(),
            agent_version: crate::AGENT_VERSION.to_string(),
            metric_format,
            blackbox_scraper_name: self.blackbox_scraper_name.clone(),
            config_items: items,
            full_sync_interval: Duration::from_secs(self.sync.full_sync_interval_secs),
            metric_registration_budget: self.sync.metric_registration_budget,
            container_registration_delay: Duration::from_secs(self.sync.container_registration_delay_secs),
            metric_deactivation_grace: Duration::from_secs(self.sync.metric_deactivation_grace_secs),
            unknown_failure_max_retries: self.sync.unknown_failure_max_retries,
            ..Default::default()
        };

        Ok(ConnectorConfig {
            synchronizer,
            mqtt_enabled: self.bleemeo.mqtt_enabled,
            ..Default::default()
        })
    }
}
