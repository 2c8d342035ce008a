//! Data models for entities mirrored between the agent and the Bleemeo API
//!
//! These types are both the wire format of the REST API and the content
//! of the local cache, so field names follow the API naming.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum registration backoff in seconds for metrics failing with an unknown error.
pub const MAX_REGISTRATION_BACKOFF_SECS: i64 = 45 * 60;

/// Base registration backoff in seconds, doubled on each failure.
pub const BASE_REGISTRATION_BACKOFF_SECS: i64 = 15;

/// Deserialize a JSON `null` as the type default.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Well-known agent type names
pub mod agent_types {
    pub const AGENT: &str = "agent";
    pub const SNMP: &str = "snmp";
    pub const MONITOR: &str = "connection_check";
    pub const KUBERNETES: &str = "kubernetes";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub is_automatic: bool,
}

/// An agent as known by the API. The main agent is the one this process runs as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub account: String,
    #[serde(default, rename = "current_config", deserialize_with = "null_as_default")]
    pub current_config_id: String,
    #[serde(default)]
    pub next_config_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fqdn: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub display_name: String,
    #[serde(default, rename = "agent_type", deserialize_with = "null_as_default")]
    pub agent_type_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub is_cluster_leader: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentType {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub display_name: String,
}

/// Account-wide configuration. Resolutions are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics_agent_whitelist: String,
    #[serde(default)]
    pub metrics_agent_resolution: i64,
    #[serde(default)]
    pub metrics_monitor_resolution: i64,
    #[serde(default)]
    pub live_process_resolution: i64,
    #[serde(default)]
    pub live_process: bool,
    #[serde(default)]
    pub docker_integration: bool,
    #[serde(default)]
    pub snmp_integration: bool,
    #[serde(default)]
    pub number_of_custom_metrics: i64,
}

/// Per agent type overrides of an account configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(rename = "account_config")]
    pub account_config_id: String,
    #[serde(rename = "agent_type")]
    pub agent_type_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics_allowlist: String,
    #[serde(default)]
    pub metrics_resolution: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(default, rename = "account_config", deserialize_with = "null_as_default")]
    pub account_config_id: String,
    #[serde(default, rename = "agent", deserialize_with = "null_as_default")]
    pub agent_id: String,
    pub label: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub instance: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub listen_addresses: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub exe_path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stack: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A monitor probes a URL from the Bleemeo infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    #[serde(default, rename = "account_config", deserialize_with = "null_as_default")]
    pub account_config_id: String,
    #[serde(default, rename = "agent", deserialize_with = "null_as_default")]
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub monitor_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub monitor_expected_content: String,
    #[serde(default)]
    pub monitor_expected_response_code: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub monitor_unexpected_content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub monitor_ca_file: String,
}

/// A container as stored in the cache.
///
/// The full inspect payload is never kept; only its SHA-256 hash is, which
/// is enough to detect a change without re-sending the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub container_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_inspect: String,
    #[serde(default)]
    pub inspect_hash: String,
    #[serde(default, rename = "container_status", deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default, rename = "container_created_at")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "container_runtime", deserialize_with = "null_as_default")]
    pub runtime: String,
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Body sent when registering or updating a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerPayload {
    pub name: String,
    pub container_id: String,
    pub container_inspect: String,
    pub container_status: String,
    pub container_created_at: Option<DateTime<Utc>>,
    pub container_runtime: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub host: String,
    pub command: String,
    pub container_started_at: Option<DateTime<Utc>>,
    pub container_finished_at: Option<DateTime<Utc>>,
    pub container_image_id: String,
    pub container_image_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_api_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    #[serde(default, rename = "threshold_low_warning")]
    pub low_warning: Option<f64>,
    #[serde(default, rename = "threshold_low_critical")]
    pub low_critical: Option<f64>,
    #[serde(default, rename = "threshold_high_warning")]
    pub high_warning: Option<f64>,
    #[serde(default, rename = "threshold_high_critical")]
    pub high_critical: Option<f64>,
}

impl Threshold {
    pub fn is_zero(&self) -> bool {
        self.low_warning.is_none()
            && self.low_critical.is_none()
            && self.high_warning.is_none()
            && self.high_critical.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    #[serde(default, rename = "unit")]
    pub unit_type: i64,
    #[serde(default, rename = "unit_text", deserialize_with = "null_as_default")]
    pub unit_text: String,
}

/// A metric registered on the API.
///
/// `labels_text` together with `agent_id` is the unique key of a metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "agent")]
    pub agent_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels_text: String,
    #[serde(default, rename = "service", deserialize_with = "null_as_default")]
    pub service_id: String,
    #[serde(default, rename = "container", deserialize_with = "null_as_default")]
    pub container_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status_of: String,
    #[serde(flatten)]
    pub threshold: Threshold,
    #[serde(flatten)]
    pub unit: Unit,
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "alerting_rule", deserialize_with = "null_as_default")]
    pub alerting_rule_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub promql_query: String,
    #[serde(default)]
    pub is_user_promql_alerting_rule: bool,
}

impl Metric {
    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }

    /// Labels parsed back from the canonical text form.
    pub fn labels(&self) -> crate::labels::Labels {
        crate::labels::text_to_labels(&self.labels_text)
    }
}

/// Why the API refused to register a metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    #[default]
    Unknown,
    AllowList,
    TooManyMetric,
}

impl FailureKind {
    /// Permanent failures are only retried on full synchronizations.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureKind::AllowList | FailureKind::TooManyMetric)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Unknown => write!(f, "unknown"),
            FailureKind::AllowList => write!(f, "not-allowed"),
            FailureKind::TooManyMetric => write!(f, "too-many-metric"),
        }
    }
}

/// Failure record of a metric that could not be registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRegistration {
    pub labels_text: String,
    pub fail_counter: u32,
    pub last_fail_at: DateTime<Utc>,
    #[serde(default)]
    pub last_fail_kind: FailureKind,
}

impl MetricRegistration {
    /// Earliest time another registration attempt is allowed.
    pub fn retry_after(&self) -> DateTime<Utc> {
        // 2^8 * 15s already exceeds the cap
        let exponent = self.fail_counter.min(8);
        let delay = BASE_REGISTRATION_BACKOFF_SECS * 2_i64.pow(exponent);
        self.last_fail_at + Duration::seconds(delay.min(MAX_REGISTRATION_BACKOFF_SECS))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalInfoMinimumVersions {
    #[serde(default, deserialize_with = "null_as_default")]
    pub glouton_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalInfoAgents {
    #[serde(default)]
    pub minimum_versions: GlobalInfoMinimumVersions,
}

/// Content of the `info` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalInfo {
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub agents: GlobalInfoAgents,
    /// Server time as fractional unix seconds
    #[serde(default)]
    pub current_time: Option<f64>,
    /// Tolerated drift in seconds, zero disables the check
    #[serde(default)]
    pub max_time_drift: f64,
    #[serde(skip)]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl GlobalInfo {
    pub fn bleemeo_time(&self) -> Option<DateTime<Utc>> {
        let current = self.current_time?;
        let millis = (current * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Difference between the local clock at fetch time and the server clock.
    pub fn time_drift(&self) -> Option<Duration> {
        Some(self.fetched_at? - self.bleemeo_time()?)
    }

    pub fn is_time_drift_too_large(&self) -> bool {
        if self.max_time_drift <= 0.0 {
            return false;
        }

        match self.time_drift() {
            Some(drift) => drift.num_milliseconds().abs() as f64 / 1000.0 > self.max_time_drift,
            None => false,
        }
    }
}

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConfigItemSource {
    #[default]
    Unknown,
    Default,
    File,
    Env,
}

impl From<ConfigItemSource> for u8 {
    fn from(source: ConfigItemSource) -> u8 {
        match source {
            ConfigItemSource::Unknown => 0,
            ConfigItemSource::Default => 1,
            ConfigItemSource::File => 2,
            ConfigItemSource::Env => 3,
        }
    }
}

impl TryFrom<u8> for ConfigItemSource {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConfigItemSource::Unknown),
            1 => Ok(ConfigItemSource::Default),
            2 => Ok(ConfigItemSource::File),
            3 => Ok(ConfigItemSource::Env),
            other => Err(format!("invalid config item source {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConfigItemType {
    #[default]
    Unknown,
    Int,
    Float,
    Bool,
    String,
    List,
    Map,
}

impl ConfigItemType {
    /// Infer the item type from a JSON value.
    pub fn of(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => ConfigItemType::Unknown,
            Value::Bool(_) => ConfigItemType::Bool,
            Value::Number(n) if n.is_f64() => ConfigItemType::Float,
            Value::Number(_) => ConfigItemType::Int,
            Value::String(_) => ConfigItemType::String,
            Value::Array(_) => ConfigItemType::List,
            Value::Object(_) => ConfigItemType::Map,
        }
    }
}

impl From<ConfigItemType> for u8 {
    fn from(kind: ConfigItemType) -> u8 {
        match kind {
            ConfigItemType::Unknown => 0,
            ConfigItemType::Int => 1,
            ConfigItemType::Float => 2,
            ConfigItemType::Bool => 3,
            ConfigItemType::String => 4,
            ConfigItemType::List => 5,
            ConfigItemType::Map => 6,
        }
    }
}

impl TryFrom<u8> for ConfigItemType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConfigItemType::Unknown),
            1 => Ok(ConfigItemType::Int),
            2 => Ok(ConfigItemType::Float),
            3 => Ok(ConfigItemType::Bool),
            4 => Ok(ConfigItemType::String),
            5 => Ok(ConfigItemType::List),
            6 => Ok(ConfigItemType::Map),
            other => Err(format!("invalid config item type {}", other)),
        }
    }
}

/// A configuration item registered on the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfigItem {
    pub id: String,
    #[serde(rename = "agent")]
    pub agent_id: String,
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub source: ConfigItemSource,
    #[serde(default, deserialize_with = "null_as_default")]
    pub path: String,
    #[serde(default, rename = "type")]
    pub item_type: ConfigItemType,
}

/// A configuration item from the local effective configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub key: String,
    pub value: serde_json::Value,
    pub priority: i32,
    pub source: ConfigItemSource,
    pub path: String,
    #[serde(rename = "type")]
    pub item_type: ConfigItemType,
}

/// Identity of a configuration item, the value excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigItemKey {
    pub key: String,
    pub priority: i32,
    pub source: ConfigItemSource,
    pub path: String,
    pub item_type: ConfigItemType,
}

/// Why synchronization with the API was disabled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    #[default]
    Unknown,
    TooManyErrors,
    AgentTooOld,
    DuplicatedAgent,
    AuthenticationError,
    TimeDrift,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisableReason::Unknown => "unspecified reason",
            DisableReason::TooManyErrors => "too many errors",
            DisableReason::AgentTooOld => "this agent being too old",
            DisableReason::DuplicatedAgent => "this agent being duplicated",
            DisableReason::AuthenticationError => "an authentication error",
            DisableReason::TimeDrift => "the local time being too far from the server time",
        };
        write!(f, "{}", text)
    }
}

/// Naming scheme of the metrics produced by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFormat {
    #[default]
    Bleemeo,
    Prometheus,
}

impl FromStr for MetricFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bleemeo" => Ok(MetricFormat::Bleemeo),
            "prometheus" => Ok(MetricFormat::Prometheus),
            other => Err(anyhow::anyhow!("unknown metric format {:?}", other)),
        }
    }
}
