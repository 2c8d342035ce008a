//! In-memory fakes shared by the unit and scenario tests

use crate::cache::Cache;
use crate::client::{ApiError, ClientError, ClientFactory, RawClient, Response};
use crate::clock::Clock;
use crate::discovery::{ContainerRegistry, ContainerRuntime, Discovery, LocalService};
use crate::models::{DisableReason, Metric};
use crate::mqtt::{MqttClient, MqttFactory, MqttOptions};
use crate::state::{State, KEY_AGENT_UUID, KEY_PASSWORD};
use crate::store::{MemoryStore, MetricPoint};
use crate::synchronizer::{ScheduledMonitor, Synchronizer, SynchronizerConfig, SynchronizerHooks, SynchronizerOptions};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const AGENT_ID: &str = "a0000000-0000-0000-0000-000000000001";
pub const ACCOUNT_ID: &str = "acc00000-0000-0000-0000-000000000001";
pub const ACCOUNT_CONFIG_ID: &str = "cfg00000-0000-0000-0000-000000000001";
pub const AGENT_TYPE_ID: &str = "typ00000-0000-0000-0000-000000000001";

/// Clock moved by hand
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// A request received by the mock API
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub resource: String,
    pub id: Option<String>,
    pub body: Option<Value>,
}

/// Reject some creations with an API error
pub type CreateHook = Box<dyn Fn(&Value) -> Option<ApiError> + Send + Sync>;

fn api_error(status: u16, path: &str, body: &str) -> ClientError {
    ClientError::Api(ApiError {
        status_code: status,
        content_type: "application/json".to_string(),
        final_url: format!("https://api.test/{}", path),
        body: body.to_string(),
    })
}

fn split_path(path: &str) -> (String, Option<String>) {
    let mut parts = path.trim_start_matches("v1/").trim_end_matches('/').splitn(2, '/');
    let resource = parts.next().unwrap_or_default().to_string();
    let id = parts.next().filter(|id| !id.is_empty()).map(str::to_string);
    (resource, id)
}

fn field_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// In-memory Bleemeo API
#[derive(Default)]
pub struct MockApi {
    resources: Mutex<HashMap<String, Vec<Value>>>,
    next_id: AtomicU64,
    requests: Mutex<Vec<RecordedRequest>>,
    create_hooks: Mutex<HashMap<String, CreateHook>>,
    failing: Mutex<HashMap<String, u16>>,
    failing_methods: Mutex<HashMap<(Method, String), u16>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    unauthorized: AtomicBool,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// API knowing the main agent, its type and account configuration.
    pub fn with_agent() -> Self {
        let api = Self::new();
        api.insert(
            "agent",
            json!({
                "id": AGENT_ID,
                "account": ACCOUNT_ID,
                "current_config": ACCOUNT_CONFIG_ID,
                "agent_type": AGENT_TYPE_ID,
                "fqdn": "server.example.com",
                "display_name": "server",
                "created_at": "2024-01-01T00:00:00Z",
                "tags": [],
            }),
        );
        api.insert(
            "agenttype",
            json!({ "id": AGENT_TYPE_ID, "name": "agent", "display_name": "Monitoring agent" }),
        );
        api.insert(
            "accountconfig",
            json!({
                "id": ACCOUNT_CONFIG_ID,
                "name": "default",
                "docker_integration": true,
                "metrics_agent_resolution": 10,
                "metrics_monitor_resolution": 60,
            }),
        );
        api.set_info(json!({
            "maintenance": false,
            "read_only": false,
            "agents": { "minimum_versions": { "glouton_version": "0.1" } },
            "max_time_drift": 0,
        }));
        api
    }

    pub fn insert(&self, resource: &str, record: Value) {
        self.resources
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .push(record);
    }

    pub fn records(&self, resource: &str) -> Vec<Value> {
        self.resources
            .lock()
            .unwrap()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.records("metric")
            .into_iter()
            .map(|raw| serde_json::from_value(raw).unwrap())
            .collect()
    }

    pub fn set_info(&self, info: Value) {
        self.resources.lock().unwrap().insert("info".to_string(), vec![info]);
    }

    pub fn on_create(&self, resource: &str, hook: CreateHook) {
        self.create_hooks.lock().unwrap().insert(resource.to_string(), hook);
    }

    /// Every request on `resource` fails with `status`.
    pub fn fail(&self, resource: &str, status: u16) {
        self.failing.lock().unwrap().insert(resource.to_string(), status);
    }

    /// Only `method` requests on `resource` fail with `status`.
    pub fn fail_method(&self, method: Method, resource: &str, status: u16) {
        self.failing_methods
            .lock()
            .unwrap()
            .insert((method, resource.to_string()), status);
    }

    pub fn recover(&self, resource: &str) {
        self.failing.lock().unwrap().remove(resource);
        self.failing_methods.lock().unwrap().retain(|(_, r), _| r != resource);
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, resource: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.resource == resource)
            .count()
    }

    pub fn count_resource(&self, resource: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.resource == resource).count()
    }

    pub fn reset_counts(&self) {
        self.requests.lock().unwrap().clear();
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    fn record(&self, method: Method, resource: &str, id: Option<String>, body: Option<Value>) {
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            resource: resource.to_string(),
            id,
            body,
        });
    }

    fn check_failures(&self, resource: &str, path: &str) -> Result<(), ClientError> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ClientError::Authentication("invalid credentials".to_string()));
        }

        match self.failing.lock().unwrap().get(resource) {
            Some(status) => Err(api_error(*status, path, "{\"detail\":\"injected failure\"}")),
            None => Ok(()),
        }
    }

    fn create(&self, resource: &str, path: &str, body: Value) -> Result<Response, ClientError> {
        if let Some(hook) = self.create_hooks.lock().unwrap().get(resource) {
            if let Some(err) = hook(&body) {
                return Err(ClientError::Api(err));
            }
        }

        let mut record = match body {
            Value::Object(map) => map,
            _ => return Err(api_error(400, path, "{\"detail\":\"expected an object\"}")),
        };

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        record
            .entry("id".to_string())
            .or_insert_with(|| json!(format!("{}-{:08}", resource, n)));
        match resource {
            "metric" => {
                record.entry("deactivated_at".to_string()).or_insert(Value::Null);
            }
            // New agents get the default account configuration
            "agent" => {
                record
                    .entry("current_config".to_string())
                    .or_insert_with(|| json!(ACCOUNT_CONFIG_ID));
            }
            _ => {}
        }

        let record = Value::Object(record);
        self.insert(resource, record.clone());

        Ok(Response {
            status: 201,
            body: record,
        })
    }

    fn update(&self, resource: &str, id: &str, path: &str, body: Value, replace: bool) -> Result<Response, ClientError> {
        let mut resources = self.resources.lock().unwrap();
        let records = resources.entry(resource.to_string()).or_default();

        let Some(record) = records.iter_mut().find(|r| r["id"] == json!(id)) else {
            return Err(api_error(404, path, "{\"detail\":\"Not found.\"}"));
        };

        let Value::Object(changes) = body else {
            return Err(api_error(400, path, "{\"detail\":\"expected an object\"}"));
        };

        let Value::Object(current) = record else {
            return Err(api_error(500, path, "{}"));
        };

        if replace {
            let kept_id = current.get("id").cloned();
            *current = Map::new();
            if let Some(id) = kept_id {
                current.insert("id".to_string(), id);
            }
        }

        for (key, value) in changes {
            if resource == "metric" && key == "active" {
                let deactivated = if value == json!(true) {
                    Value::Null
                } else {
                    json!(Utc::now())
                };
                current.insert("deactivated_at".to_string(), deactivated);
                continue;
            }
            current.insert(key, value);
        }

        Ok(Response {
            status: 200,
            body: record.clone(),
        })
    }

    fn delete(&self, resource: &str, id: &str, path: &str) -> Result<Response, ClientError> {
        let mut resources = self.resources.lock().unwrap();
        let records = resources.entry(resource.to_string()).or_default();
        let before = records.len();
        records.retain(|r| r["id"] != json!(id));

        if records.len() == before {
            return Err(api_error(404, path, "{\"detail\":\"Not found.\"}"));
        }

        Ok(Response {
            status: 204,
            body: Value::Null,
        })
    }
}

#[async_trait]
impl RawClient for MockApi {
    async fn do_request(
        &self,
        method: Method,
        path: &str,
        _params: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Response, ClientError> {
        let (resource, id) = split_path(path);
        self.record(method.clone(), &resource, id.clone(), body.clone());
        self.check_failures(&resource, path)?;
        if let Some(status) = self.failing_methods.lock().unwrap().get(&(method.clone(), resource.clone())) {
            return Err(api_error(*status, path, "{\"detail\":\"injected failure\"}"));
        }

        let body = body.unwrap_or(Value::Null);
        let not_found = || api_error(404, path, "{\"detail\":\"Not found.\"}");

        match id {
            None if method == Method::GET && resource == "info" => {
                let info = self.records("info").into_iter().next().ok_or_else(not_found)?;
                Ok(Response { status: 200, body: info })
            }
            None if method == Method::POST => self.create(&resource, path, body),
            Some(id) if method == Method::GET => {
                let record = self
                    .records(&resource)
                    .into_iter()
                    .find(|r| r["id"] == json!(id))
                    .ok_or_else(not_found)?;
                Ok(Response { status: 200, body: record })
            }
            Some(id) if method == Method::PUT => self.update(&resource, &id, path, body, true),
            Some(id) if method == Method::PATCH => self.update(&resource, &id, path, body, false),
            Some(id) if method == Method::DELETE => self.delete(&resource, &id, path),
            _ => Err(api_error(405, path, "{\"detail\":\"Method not allowed.\"}")),
        }
    }

    async fn do_with_body(&self, path: &str, _content_type: &str, body: Vec<u8>) -> Result<u16, ClientError> {
        let (resource, _) = split_path(path);
        self.record(Method::POST, &resource, None, None);
        self.check_failures(&resource, path)?;

        self.uploads.lock().unwrap().push((path.to_string(), body));
        Ok(201)
    }

    async fn iter(&self, resource: &str, params: &[(&str, &str)]) -> Result<Vec<Value>, ClientError> {
        self.record(Method::GET, resource, None, None);
        self.check_failures(resource, resource)?;

        let records = self
            .records(resource)
            .into_iter()
            .filter(|record| {
                params.iter().all(|(key, value)| match *key {
                    "fields" => true,
                    "active" => record.get("deactivated_at").map(Value::is_null).unwrap_or(true) == (*value == "True"),
                    _ => record.get(*key).map(field_as_text).as_deref() == Some(*value),
                })
            })
            .collect();

        Ok(records)
    }
}

/// Hands out the same mock API for every client
pub struct MockFactory {
    pub api: Arc<MockApi>,
    pub registrations: AtomicU32,
}

impl MockFactory {
    pub fn new(api: Arc<MockApi>) -> Self {
        Self {
            api,
            registrations: AtomicU32::new(0),
        }
    }
}

impl ClientFactory for MockFactory {
    fn authenticated(&self, _agent_id: &str, _password: &str) -> Result<Arc<dyn RawClient>> {
        Ok(self.api.clone())
    }

    fn registration(&self, _account_id: &str, _registration_key: &str) -> Result<Arc<dyn RawClient>> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(self.api.clone())
    }
}

/// Hooks recording what the synchronizer told the agent
#[derive(Default)]
pub struct RecordingHooks {
    pub config_updates: Mutex<Vec<bool>>,
    pub disables: Mutex<Vec<(DisableReason, DateTime<Utc>)>>,
    pub threshold_updates: AtomicU32,
    pub label_updates: AtomicU32,
    pub monitors: Mutex<Vec<ScheduledMonitor>>,
    pub initialized: AtomicBool,
    pub mqtt_connected: AtomicBool,
    pub read_only: AtomicBool,
    pub maintenance: Mutex<Vec<bool>>,
}

impl SynchronizerHooks for RecordingHooks {
    fn update_config(&self, name_changed: bool) {
        self.config_updates.lock().unwrap().push(name_changed);
    }

    fn disable(&self, reason: DisableReason, until: DateTime<Utc>) {
        self.disables.lock().unwrap().push((reason, until));
    }

    fn set_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn is_mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::SeqCst)
    }

    fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.lock().unwrap().push(maintenance);
    }

    fn set_mqtt_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn is_mqtt_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn update_thresholds(&self, _metrics: &[Metric]) {
        self.threshold_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_labels_update(&self) {
        self.label_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn update_monitors(&self, monitors: &[ScheduledMonitor]) {
        *self.monitors.lock().unwrap() = monitors.to_vec();
    }
}

/// Discovery whose services a test can change between passes
#[derive(Default)]
pub struct FakeDiscovery {
    services: Mutex<Vec<LocalService>>,
}

impl FakeDiscovery {
    pub fn set(&self, services: Vec<LocalService>) {
        *self.services.lock().unwrap() = services;
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn discovery(&self, _max_age: Duration) -> Result<Vec<LocalService>> {
        Ok(self.services.lock().unwrap().clone())
    }
}

/// Synchronizer wired to in-memory fakes
pub struct Harness {
    pub api: Arc<MockApi>,
    pub factory: Arc<MockFactory>,
    pub clock: Arc<MockClock>,
    pub cache: Arc<Cache>,
    pub state: Arc<State>,
    pub store: Arc<MemoryStore>,
    pub containers: Arc<ContainerRegistry>,
    pub discovery: Arc<FakeDiscovery>,
    pub hooks: Arc<RecordingHooks>,
    pub synchronizer: Synchronizer,
}

pub fn test_config() -> SynchronizerConfig {
    SynchronizerConfig {
        account_id: ACCOUNT_ID.to_string(),
        registration_key: "registration-key-0123456789".to_string(),
        fqdn: "server.example.com".to_string(),
        display_name: "server".to_string(),
        agent_version: "1.2.3".to_string(),
        ..Default::default()
    }
}

impl Harness {
    /// Harness for an agent already registered on the mock API.
    pub fn new() -> Self {
        Self::with(Arc::new(MockApi::with_agent()), test_config(), true)
    }

    pub fn with(api: Arc<MockApi>, config: SynchronizerConfig, registered: bool) -> Self {
        let clock = Arc::new(MockClock::new(start_time()));
        let state = Arc::new(State::in_memory());
        if registered {
            state.set(KEY_AGENT_UUID, &AGENT_ID).unwrap();
            state.set(KEY_PASSWORD, &"secret-password").unwrap();
        }

        let cache = Arc::new(Cache::new());
        let store = Arc::new(MemoryStore::new());
        let containers = Arc::new(ContainerRegistry::new(Some("1.43".to_string())));
        let discovery = Arc::new(FakeDiscovery::default());
        let hooks = Arc::new(RecordingHooks::default());
        let factory = Arc::new(MockFactory::new(api.clone()));

        let synchronizer = Synchronizer::new(SynchronizerOptions {
            config,
            cache: cache.clone(),
            state: state.clone(),
            client_factory: factory.clone(),
            discovery: discovery.clone(),
            container_runtime: Some(containers.clone() as Arc<dyn ContainerRuntime>),
            store: store.clone(),
            diagnostics: None,
            hooks: hooks.clone(),
            clock: clock.clone(),
        });

        Self {
            api,
            factory,
            clock,
            cache,
            state,
            store,
            containers,
            discovery,
            hooks,
            synchronizer,
        }
    }
}

/// MQTT client reporting whatever the test sets
#[derive(Default)]
pub struct FakeMqtt {
    pub connected: AtomicBool,
    pub last_report: Mutex<Option<DateTime<Utc>>>,
    pub healthy: AtomicBool,
    pub read_only: AtomicBool,
    pub suspended: AtomicBool,
    pub disabled: Mutex<Option<(DisableReason, DateTime<Utc>)>>,
    pub cleared: Mutex<Vec<(DisableReason, Duration)>>,
    pub points: Mutex<Vec<MetricPoint>>,
    pub options: Mutex<Option<MqttOptions>>,
}

#[async_trait]
impl MqttClient for FakeMqtt {
    async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let _ = shutdown.recv().await;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn last_report(&self) -> Option<DateTime<Utc>> {
        *self.last_report.lock().unwrap()
    }

    fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn disable(&self, until: DateTime<Utc>, reason: DisableReason) {
        *self.disabled.lock().unwrap() = Some((reason, until));
    }

    fn clear_disable(&self, reason: DisableReason, delay: Duration) {
        self.cleared.lock().unwrap().push((reason, delay));
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn suspend_sending(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    fn pop_points(&self) -> Vec<MetricPoint> {
        std::mem::take(&mut *self.points.lock().unwrap())
    }

    fn diagnostic_page(&self) -> String {
        format!("connected: {}\n", self.connected())
    }
}

/// Creates `FakeMqtt` clients and keeps them for inspection
#[derive(Default)]
pub struct FakeMqttFactory {
    pub created: Mutex<Vec<Arc<FakeMqtt>>>,
}

impl FakeMqttFactory {
    pub fn last(&self) -> Option<Arc<FakeMqtt>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl MqttFactory for FakeMqttFactory {
    fn create(&self, options: MqttOptions) -> Result<Arc<dyn MqttClient>> {
        let client = Arc::new(FakeMqtt::default());
        client.healthy.store(true, Ordering::SeqCst);
        *client.points.lock().unwrap() = options.initial_points.clone();
        *client.options.lock().unwrap() = Some(options);
        self.created.lock().unwrap().push(client.clone());
        Ok(client)
    }
}
