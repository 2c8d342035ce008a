//! Connector: runs the synchronizer and the MQTT transport side by side
//!
//! This module provides:
//! - Creation of the MQTT client once the agent is registered, and its
//!   restart when it stays disconnected for too long
//! - A supervisor pushing the `agent_status` heartbeat and reporting health
//! - Disable windows shared by the synchronizer and MQTT
//! - Diagnostic page and archive of the connection to the Bleemeo platform

use crate::cache::Cache;
use crate::client::ClientFactory;
use crate::clock::Clock;
use crate::diagnostic::{ArchiveWriter, DiagnosticSource};
use crate::discovery::{ContainerRuntime, Discovery};
use crate::health::{Component, HealthRegistry};
use crate::labels::{Labels, INSTANCE_UUID, META_BLEEMEO_UUID, META_SNMP_TARGET, METRIC_NAME};
use crate::models::{agent_types, DisableReason, Metric, MetricRegistration};
use crate::mqtt::{MqttClient, MqttFactory, MqttOptions};
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::state::{State, KEY_PASSWORD};
use crate::store::{Annotations, MetricPoint, MetricStore, Point};
use crate::synchronizer::config::to_chrono;
use crate::synchronizer::{
    ScheduledMonitor, Synchronizer, SynchronizerConfig, SynchronizerHooks, SynchronizerOptions, AGENT_STATUS_NAME,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, info, warn};

/// Failures written to the diagnostic archive
const MAX_FAILURES_IN_ARCHIVE: usize = 50;

/// Configuration of the connector
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub synchronizer: SynchronizerConfig,
    /// Whether points are sent over MQTT
    pub mqtt_enabled: bool,
    /// Interval of the `agent_status` heartbeat (default: 10 seconds)
    pub agent_status_interval: Duration,
    /// Interval of the health checks (default: 1 minute)
    pub health_check_interval: Duration,
    /// MQTT down for this long is restarted (default: 1 hour)
    pub mqtt_restart_after: Duration,
    /// Minimum delay between two MQTT restarts (default: 4 hours)
    pub mqtt_restart_min_interval: Duration,
    /// MQTT down for this long stops the connector with an error (default: 36 hours)
    pub unhealthy_exit_after: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            synchronizer: SynchronizerConfig::default(),
            mqtt_enabled: true,
            agent_status_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
            mqtt_restart_after: Duration::from_secs(3600),
            mqtt_restart_min_interval: Duration::from_secs(4 * 3600),
            unhealthy_exit_after: Duration::from_secs(36 * 3600),
        }
    }
}

/// Collaborators of the connector
pub struct ConnectorOptions {
    pub config: ConnectorConfig,
    pub cache: Arc<Cache>,
    pub state: Arc<State>,
    pub client_factory: Arc<dyn ClientFactory>,
    pub mqtt_factory: Option<Arc<dyn MqttFactory>>,
    pub discovery: Arc<dyn Discovery>,
    pub container_runtime: Option<Arc<dyn ContainerRuntime>>,
    pub store: Arc<dyn MetricStore>,
    pub diagnostics: Option<Arc<dyn DiagnosticSource>>,
    /// Callbacks into the rest of the agent
    pub hooks: Arc<dyn SynchronizerHooks>,
    pub health: Arc<HealthRegistry>,
    pub clock: Arc<dyn Clock>,
}

/// What the supervisor does about the MQTT client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MqttAction {
    Nothing,
    Restart,
    Terminate,
}

/// Disabled synchronization that won't recover without a human.
fn needs_operator(reason: DisableReason) -> bool {
    matches!(
        reason,
        DisableReason::AgentTooOld | DisableReason::DuplicatedAgent | DisableReason::AuthenticationError
    )
}

/// Decide from the time MQTT was last healthy and last restarted.
pub(crate) fn mqtt_action(
    config: &ConnectorConfig,
    now: DateTime<Utc>,
    healthy: bool,
    last_healthy: DateTime<Utc>,
    last_restart: Option<DateTime<Utc>>,
) -> MqttAction {
    if healthy {
        return MqttAction::Nothing;
    }

    let down = now - last_healthy;
    if down >= to_chrono(config.unhealthy_exit_after) {
        return MqttAction::Terminate;
    }

    let restart_allowed = last_restart
        .map(|at| now - at >= to_chrono(config.mqtt_restart_min_interval))
        .unwrap_or(true);

    if down >= to_chrono(config.mqtt_restart_after) && restart_allowed {
        MqttAction::Restart
    } else {
        MqttAction::Nothing
    }
}

/// Delay before MQTT follows a disable change
fn mqtt_disable_delay(reason: DisableReason) -> Duration {
    match reason {
        DisableReason::TooManyErrors | DisableReason::Unknown => Duration::from_secs(20),
        _ => Duration::from_secs(80),
    }
}

/// Keep the first 6 and last 4 characters of a secret.
pub(crate) fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 10), tail)
}

#[derive(Default)]
struct ConnectorInner {
    mqtt: Option<Arc<dyn MqttClient>>,
    mqtt_started_at: Option<DateTime<Utc>>,
    last_mqtt_restart: Option<DateTime<Utc>>,
    mqtt_restarts: u32,
    disabled_until: Option<DateTime<Utc>>,
    disable_reason: Option<DisableReason>,
    read_only: bool,
}

/// State shared between the connector tasks and the synchronizer hooks
struct ConnectorShared {
    inner: Mutex<ConnectorInner>,
    initialized: watch::Sender<bool>,
    restart: Notify,
    clock: Arc<dyn Clock>,
}

impl ConnectorShared {
    fn lock(&self) -> MutexGuard<'_, ConnectorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mqtt(&self) -> Option<Arc<dyn MqttClient>> {
        self.lock().mqtt.clone()
    }

    /// Extend the disable window and forward it to MQTT.
    fn disable(&self, reason: DisableReason, until: DateTime<Utc>) {
        let mqtt = {
            let mut inner = self.lock();
            if inner.disabled_until.map(|current| current >= until).unwrap_or(false) {
                return;
            }
            inner.disabled_until = Some(until);
            inner.disable_reason = Some(reason);
            inner.mqtt.clone()
        };

        if let Some(mqtt) = mqtt {
            mqtt.disable(until + to_chrono(mqtt_disable_delay(reason)), reason);
        }
    }

    fn clear_disable(&self, reason: DisableReason) {
        let mqtt = {
            let mut inner = self.lock();
            if inner.disable_reason != Some(reason) {
                return;
            }
            inner.disabled_until = None;
            inner.disable_reason = None;
            inner.mqtt.clone()
        };

        if let Some(mqtt) = mqtt {
            mqtt.clear_disable(reason, mqtt_disable_delay(reason));
        }
    }

    fn disabled_until(&self) -> Option<(DisableReason, DateTime<Utc>)> {
        let inner = self.lock();
        match (inner.disable_reason, inner.disabled_until) {
            (Some(reason), Some(until)) if until > self.clock.now() => Some((reason, until)),
            _ => None,
        }
    }
}

/// Bridges synchronizer callbacks to the connector and the agent
struct ConnectorHooks {
    shared: Arc<ConnectorShared>,
    agent: Arc<dyn SynchronizerHooks>,
}

impl SynchronizerHooks for ConnectorHooks {
    fn update_config(&self, name_changed: bool) {
        self.agent.update_config(name_changed);
    }

    fn disable(&self, reason: DisableReason, until: DateTime<Utc>) {
        self.shared.disable(reason, until);
        self.agent.disable(reason, until);
    }

    fn set_initialized(&self) {
        self.shared.initialized.send_replace(true);
        self.agent.set_initialized();
    }

    fn is_mqtt_connected(&self) -> bool {
        self.shared.mqtt().map(|m| m.connected()).unwrap_or(false)
    }

    fn set_maintenance(&self, maintenance: bool) {
        if let Some(mqtt) = self.shared.mqtt() {
            mqtt.suspend_sending(maintenance);
        }
        self.agent.set_maintenance(maintenance);
    }

    fn set_mqtt_read_only(&self, read_only: bool) {
        let mqtt = {
            let mut inner = self.shared.lock();
            inner.read_only = read_only;
            inner.mqtt.clone()
        };

        if let Some(mqtt) = mqtt {
            mqtt.set_read_only(read_only);
        }
    }

    fn is_mqtt_read_only(&self) -> bool {
        self.shared.lock().read_only
    }

    fn update_thresholds(&self, metrics: &[Metric]) {
        self.agent.update_thresholds(metrics);
    }

    fn notify_labels_update(&self) {
        self.agent.notify_labels_update();
    }

    fn update_monitors(&self, monitors: &[ScheduledMonitor]) {
        self.agent.update_monitors(monitors);
    }
}

/// Connection of the agent to the Bleemeo platform
pub struct Connector {
    config: ConnectorConfig,
    synchronizer: Arc<Synchronizer>,
    shared: Arc<ConnectorShared>,
    cache: Arc<Cache>,
    state: Arc<State>,
    store: Arc<dyn MetricStore>,
    mqtt_factory: Option<Arc<dyn MqttFactory>>,
    health: Arc<HealthRegistry>,
    clock: Arc<dyn Clock>,
    metrics: SyncMetrics,
}

impl Connector {
    pub fn new(options: ConnectorOptions) -> Self {
        let (initialized, _) = watch::channel(false);
        let shared = Arc::new(ConnectorShared {
            inner: Mutex::new(ConnectorInner::default()),
            initialized,
            restart: Notify::new(),
            clock: options.clock.clone(),
        });

        let hooks = Arc::new(ConnectorHooks {
            shared: shared.clone(),
            agent: options.hooks,
        });

        let synchronizer = Arc::new(Synchronizer::new(SynchronizerOptions {
            config: options.config.synchronizer.clone(),
            cache: options.cache.clone(),
            state: options.state.clone(),
            client_factory: options.client_factory,
            discovery: options.discovery,
            container_runtime: options.container_runtime,
            store: options.store.clone(),
            diagnostics: options.diagnostics,
            hooks,
            clock: options.clock.clone(),
        }));

        Self {
            config: options.config,
            synchronizer,
            shared,
            cache: options.cache,
            state: options.state,
            store: options.store,
            mqtt_factory: options.mqtt_factory,
            health: options.health,
            clock: options.clock,
            metrics: SyncMetrics::new(),
        }
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    /// Run every task until shutdown. The first task failing stops the others.
    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        for component in Component::ALL {
            self.health.register(component).await;
        }

        let result = tokio::try_join!(
            self.synchronizer.run(shutdown.subscribe()),
            self.run_mqtt(shutdown.subscribe()),
            self.run_supervisor(shutdown.subscribe()),
        );

        if let Err(e) = self.cache.save(&self.state) {
            error!(error = %format!("{:#}", e), "Failed to save the cache");
        }

        if let Err(e) = &result {
            error!(error = %format!("{:#}", e), "Connector stopped");
            // Wake the tasks still running
            let _ = shutdown.send(());
        }

        result.map(|_| ())
    }

    fn create_mqtt(&self, factory: &dyn MqttFactory, initial_points: Vec<MetricPoint>) -> Result<Arc<dyn MqttClient>> {
        let agent_id = self.synchronizer.agent_id().context("agent is not registered")?;
        let password = self
            .state
            .get_string(KEY_PASSWORD)?
            .context("agent password is missing from the state")?;

        let read_only = self.shared.lock().read_only;
        let client = factory
            .create(MqttOptions {
                agent_id,
                password,
                initial_points,
                read_only,
            })
            .context("Failed to create the MQTT client")?;

        {
            let mut inner = self.shared.lock();
            inner.mqtt = Some(client.clone());
            inner.mqtt_started_at = Some(self.clock.now());
        }

        if let Some((reason, until)) = self.shared.disabled_until() {
            client.disable(until + to_chrono(mqtt_disable_delay(reason)), reason);
        }

        Ok(client)
    }

    async fn run_mqtt(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let Some(factory) = self.mqtt_factory.clone().filter(|_| self.config.mqtt_enabled) else {
            debug!("MQTT is disabled");
            let _ = shutdown.recv().await;
            return Ok(());
        };

        let mut initialized = self.shared.initialized.subscribe();
        loop {
            if *initialized.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = initialized.changed() => changed.context("connector state dropped")?,
                _ = shutdown.recv() => return Ok(()),
            }
        }

        let mut initial_points = Vec::new();
        loop {
            let client = self.create_mqtt(factory.as_ref(), std::mem::take(&mut initial_points))?;
            let (stop, stop_rx) = broadcast::channel(1);
            let run = client.run(stop_rx);
            tokio::pin!(run);

            tokio::select! {
                result = &mut run => {
                    return result.context("MQTT client stopped");
                }
                _ = self.shared.restart.notified() => {
                    let _ = stop.send(());
                    if let Err(e) = run.await {
                        warn!(error = %format!("{:#}", e), "MQTT client failed while stopping");
                    }
                    initial_points = client.pop_points();
                    info!(points = initial_points.len(), "Restarting the MQTT client");
                }
                _ = shutdown.recv() => {
                    let _ = stop.send(());
                    return run.await;
                }
            }
        }
    }

    async fn run_supervisor(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.agent_status_interval);
        let mut last_check: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return Ok(()),
            }

            let now = self.clock.now();
            if self.connected() {
                self.push_agent_status(now);
            }

            let due = last_check
                .map(|at| now - at >= to_chrono(self.config.health_check_interval))
                .unwrap_or(true);
            if !due {
                continue;
            }
            last_check = Some(now);

            self.update_health().await;
            self.check_mqtt(now)?;
        }
    }

    fn push_agent_status(&self, now: DateTime<Utc>) {
        let Some(agent_id) = self.synchronizer.agent_id() else {
            return;
        };

        let labels: Labels = [
            (METRIC_NAME.to_string(), AGENT_STATUS_NAME.to_string()),
            (INSTANCE_UUID.to_string(), agent_id),
        ]
        .into_iter()
        .collect();

        self.store.push_points(vec![MetricPoint {
            labels,
            annotations: Annotations::default(),
            point: Point { time: now, value: 1.0 },
        }]);
    }

    async fn update_health(&self) {
        let health = &self.health;

        match (self.synchronizer.agent_id(), self.disabled_until()) {
            (None, _) => health.set_degraded(Component::Synchronizer, "agent is not registered yet").await,
            (Some(_), Some((reason, until))) => {
                let message = format!("disabled until {} due to {}", until.to_rfc3339(), reason);
                if needs_operator(reason) {
                    health.set_unhealthy(Component::Synchronizer, message).await
                } else {
                    health.set_degraded(Component::Synchronizer, message).await
                }
            }
            (Some(_), None) if self.synchronizer.successive_errors() > 0 => {
                health
                    .set_degraded(
                        Component::Synchronizer,
                        format!("{} successive errors", self.synchronizer.successive_errors()),
                    )
                    .await
            }
            (Some(_), None) => health.set_healthy(Component::Synchronizer).await,
        }

        match self.shared.mqtt() {
            Some(mqtt) if mqtt.connected() => health.set_healthy(Component::Mqtt).await,
            Some(_) => health.set_degraded(Component::Mqtt, "not connected").await,
            None if self.config.mqtt_enabled => health.set_degraded(Component::Mqtt, "not started").await,
            None => health.set_healthy(Component::Mqtt).await,
        }

        if self.cache.is_dirty() {
            health.set_degraded(Component::Cache, "changes not saved yet").await;
        } else {
            health.set_healthy(Component::Cache).await;
        }

        if self.synchronizer.agent_id().is_some() {
            health.set_healthy(Component::ApiClient).await;
            health.set_ready(true).await;
        }
    }

    fn check_mqtt(&self, now: DateTime<Utc>) -> Result<()> {
        let (mqtt, started_at, last_restart) = {
            let inner = self.shared.lock();
            (inner.mqtt.clone(), inner.mqtt_started_at, inner.last_mqtt_restart)
        };

        let (Some(mqtt), Some(started_at)) = (mqtt, started_at) else {
            return Ok(());
        };

        // MQTT is expected to be down while disabled
        if self.disabled_until().is_some() {
            return Ok(());
        }

        let healthy = mqtt.connected() && mqtt.health_check();
        let last_healthy = mqtt.last_report().map(|at| at.max(started_at)).unwrap_or(started_at);

        match mqtt_action(&self.config, now, healthy, last_healthy, last_restart) {
            MqttAction::Nothing => Ok(()),
            MqttAction::Restart => {
                let restarts = {
                    let mut inner = self.shared.lock();
                    inner.last_mqtt_restart = Some(now);
                    inner.mqtt_restarts += 1;
                    inner.mqtt_restarts
                };

                let cause = if mqtt.health_check() { "disconnected" } else { "unhealthy" };
                self.metrics.inc_mqtt_restart(cause);
                StructuredLogger::new(self.agent_id().unwrap_or_default()).log_mqtt_restart(cause, restarts);
                self.shared.restart.notify_one();
                Ok(())
            }
            MqttAction::Terminate => {
                error!(
                    last_healthy = %last_healthy.to_rfc3339(),
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "MQTT connection is down for too long, stopping"
                );
                bail!("MQTT connection down since {}", last_healthy.to_rfc3339())
            }
        }
    }

    /// Disable synchronization and MQTT until `until`. Never shortens a current window.
    pub fn disable(&self, reason: DisableReason, until: DateTime<Utc>) {
        self.synchronizer.disable(reason, until);
        self.shared.disable(reason, until);
    }

    /// Lift a disable window, only when it was set for `reason`.
    pub fn clear_disable(&self, reason: DisableReason) {
        self.synchronizer.clear_disable(reason);
        self.shared.clear_disable(reason);
    }

    pub fn disabled_until(&self) -> Option<(DisableReason, DateTime<Utc>)> {
        self.shared.disabled_until()
    }

    /// Add the owning agent to the labels of a point.
    ///
    /// Points of an SNMP target belong to the agent with that FQDN; they are
    /// dropped until that agent is known.
    pub fn relabel(&self, labels: &Labels) -> Option<Labels> {
        let mut relabeled = labels.clone();

        let owner = match labels.get(META_SNMP_TARGET) {
            Some(target) => {
                let snmp_type = self.cache.agent_type_by_name(agent_types::SNMP)?;
                self.cache
                    .agents()
                    .into_iter()
                    .find(|a| a.agent_type_id == snmp_type.id && &a.fqdn == target)?
                    .id
            }
            None => self.agent_id()?,
        };

        relabeled.insert(META_BLEEMEO_UUID.to_string(), owner);
        Some(relabeled)
    }

    pub fn account_id(&self) -> String {
        self.cache.account_id()
    }

    pub fn agent_id(&self) -> Option<String> {
        self.synchronizer.agent_id()
    }

    /// Tags of the main agent as known by the API
    pub fn tags(&self) -> Vec<String> {
        self.cache.agent().tags.into_iter().map(|t| t.name).collect()
    }

    pub fn registration_at(&self) -> Option<DateTime<Utc>> {
        self.cache.agent().created_at
    }

    pub fn connected(&self) -> bool {
        self.shared.mqtt().map(|m| m.connected()).unwrap_or(false)
    }

    pub fn last_report(&self) -> Option<DateTime<Utc>> {
        self.shared.mqtt().and_then(|m| m.last_report())
    }

    pub fn is_maintenance(&self) -> bool {
        self.synchronizer.is_maintenance()
    }

    pub fn update_containers(&self) {
        self.synchronizer.update_containers();
    }

    pub fn update_info(&self) {
        self.synchronizer.update_info();
    }

    pub fn update_monitors(&self) {
        self.synchronizer.update_monitors();
    }

    pub fn update_metrics(&self) {
        self.synchronizer.update_metrics();
    }

    pub fn schedule_diagnostic_upload(&self, filename: &str, request_token: &str, content: Vec<u8>) {
        self.synchronizer
            .schedule_diagnostic_upload(filename, request_token, content);
    }

    /// Text summary of the connection state.
    pub fn diagnostic_page(&self) -> String {
        let mut page = String::new();
        let (started_at, restarts, read_only) = {
            let inner = self.shared.lock();
            (inner.mqtt_started_at, inner.mqtt_restarts, inner.read_only)
        };

        let _ = writeln!(page, "Bleemeo connector");
        let _ = writeln!(page, "account_id: {}", self.account_id());
        let _ = writeln!(
            page,
            "registration_key: {}",
            mask_secret(&self.config.synchronizer.registration_key)
        );
        let _ = writeln!(page, "mqtt_enabled: {}", self.config.mqtt_enabled);
        let _ = writeln!(page, "mqtt_connected: {}", self.connected());
        let _ = writeln!(page, "mqtt_read_only: {}", read_only);
        let _ = writeln!(
            page,
            "mqtt_started_at: {}",
            started_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
        );
        let _ = writeln!(page, "mqtt_restarts: {}", restarts);
        let _ = writeln!(
            page,
            "last_report: {}",
            self.last_report().map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
        );

        match self.disabled_until() {
            Some((reason, until)) => {
                let _ = writeln!(page, "disabled_until: {} due to {}", until.to_rfc3339(), reason);
            }
            None => {
                let _ = writeln!(page, "disabled_until: not disabled");
            }
        }

        let _ = writeln!(page, "\nSynchronizer");
        page.push_str(&self.synchronizer.diagnostic_page());
        page
    }

    /// Write the connector state to a diagnostic archive.
    pub fn write_diagnostic_archive(&self, archive: &mut dyn ArchiveWriter) -> Result<()> {
        archive.add_file("bleemeo-connector.txt", self.diagnostic_page().as_bytes())?;
        archive.add_file("bleemeo-cache.txt", self.cache.summary().as_bytes())?;
        archive.add_file(
            "metric-registration-failed.txt",
            failed_registrations_report(self.cache.metric_registrations_fail()).as_bytes(),
        )?;

        if let Some(mqtt) = self.shared.mqtt() {
            archive.add_file("bleemeo-mqtt.txt", mqtt.diagnostic_page().as_bytes())?;
        }

        Ok(())
    }
}

fn failed_registrations_report(mut failures: Vec<MetricRegistration>) -> String {
    let total = failures.len();
    let mut report = String::new();

    if total > MAX_FAILURES_IN_ARCHIVE {
        let _ = writeln!(
            report,
            "{} metrics failed to register, showing a random sample of {}",
            total, MAX_FAILURES_IN_ARCHIVE
        );
        failures.shuffle(&mut rand::thread_rng());
        failures.truncate(MAX_FAILURES_IN_ARCHIVE);
    } else {
        let _ = writeln!(report, "{} metrics failed to register", total);
    }

    failures.sort_by(|a, b| a.labels_text.cmp(&b.labels_text));
    for failure in failures {
        let _ = writeln!(
            report,
            "{} failed {} times, last at {} ({}), retry after {}",
            failure.labels_text,
            failure.fail_counter,
            failure.last_fail_at.to_rfc3339(),
            failure.last_fail_kind,
            failure.retry_after().to_rfc3339(),
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::MemoryArchive;
    use crate::discovery::StaticDiscovery;
    use crate::health::ComponentStatus;
    use crate::models::FailureKind;
    use crate::store::MemoryStore;
    use crate::test_support::{
        start_time, test_config, FakeMqttFactory, MockApi, MockClock, MockFactory, RecordingHooks, AGENT_ID,
    };
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Fixture {
        connector: Arc<Connector>,
        api: Arc<MockApi>,
        clock: Arc<MockClock>,
        store: Arc<MemoryStore>,
        mqtt: Arc<FakeMqttFactory>,
        cache: Arc<Cache>,
    }

    fn fixture(config: ConnectorConfig) -> Fixture {
        let api = Arc::new(MockApi::with_agent());
        let clock = Arc::new(MockClock::new(start_time()));
        let state = Arc::new(State::in_memory());
        state.set(crate::state::KEY_AGENT_UUID, &AGENT_ID).unwrap();
        state.set(KEY_PASSWORD, &"secret-password").unwrap();
        let cache = Arc::new(Cache::new());
        let store = Arc::new(MemoryStore::new());
        let mqtt = Arc::new(FakeMqttFactory::default());

        let connector = Arc::new(Connector::new(ConnectorOptions {
            config,
            cache: cache.clone(),
            state,
            client_factory: Arc::new(MockFactory::new(api.clone())),
            mqtt_factory: Some(mqtt.clone()),
            discovery: Arc::new(StaticDiscovery::default()),
            container_runtime: None,
            store: store.clone(),
            diagnostics: None,
            hooks: Arc::new(RecordingHooks::default()),
            health: Arc::new(HealthRegistry::new()),
            clock: clock.clone(),
        }));

        Fixture {
            connector,
            api,
            clock,
            store,
            mqtt,
            cache,
        }
    }

    fn config() -> ConnectorConfig {
        ConnectorConfig {
            synchronizer: test_config(),
            agent_status_interval: Duration::from_millis(10),
            health_check_interval: Duration::from_secs(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_mqtt_action_thresholds() {
        let config = ConnectorConfig::default();
        let now = start_time();

        assert_eq!(mqtt_action(&config, now, true, now - ChronoDuration::hours(50), None), MqttAction::Nothing);
        assert_eq!(
            mqtt_action(&config, now, false, now - ChronoDuration::minutes(30), None),
            MqttAction::Nothing
        );
        assert_eq!(
            mqtt_action(&config, now, false, now - ChronoDuration::minutes(61), None),
            MqttAction::Restart
        );
        assert_eq!(
            mqtt_action(
                &config,
                now,
                false,
                now - ChronoDuration::hours(5),
                Some(now - ChronoDuration::hours(2))
            ),
            MqttAction::Nothing
        );
        assert_eq!(
            mqtt_action(
                &config,
                now,
                false,
                now - ChronoDuration::hours(5),
                Some(now - ChronoDuration::hours(4))
            ),
            MqttAction::Restart
        );
        assert_eq!(
            mqtt_action(
                &config,
                now,
                false,
                now - ChronoDuration::hours(36),
                Some(now - ChronoDuration::hours(1))
            ),
            MqttAction::Terminate
        );
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("0123456789abcdef"), "012345******cdef");
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn test_failed_registrations_are_sampled() {
        let failures: Vec<MetricRegistration> = (0..120)
            .map(|i| MetricRegistration {
                labels_text: format!("__name__=\"m{:03}\"", i),
                fail_counter: 1,
                last_fail_at: start_time(),
                last_fail_kind: FailureKind::Unknown,
            })
            .collect();

        let report = failed_registrations_report(failures);

        assert!(report.starts_with("120 metrics failed to register, showing a random sample of 50"));
        assert_eq!(report.lines().count(), 51);
    }

    #[tokio::test]
    async fn test_disable_is_forwarded_and_only_extends() {
        let f = fixture(config());
        f.connector.synchronizer().initialize().await.unwrap();
        let now = f.clock.now();

        f.connector.disable(DisableReason::TooManyErrors, now + ChronoDuration::minutes(5));
        f.connector.disable(DisableReason::DuplicatedAgent, now + ChronoDuration::minutes(1));

        assert_eq!(
            f.connector.disabled_until(),
            Some((DisableReason::TooManyErrors, now + ChronoDuration::minutes(5)))
        );
        assert!(f.connector.synchronizer().disabled_until().is_some());

        f.connector.clear_disable(DisableReason::DuplicatedAgent);
        assert!(f.connector.disabled_until().is_some());

        f.connector.clear_disable(DisableReason::TooManyErrors);
        assert!(f.connector.disabled_until().is_none());
        assert!(f.connector.synchronizer().disabled_until().is_none());
    }

    #[tokio::test]
    async fn test_health_follows_disable_reason() {
        let f = fixture(config());
        f.connector.synchronizer().initialize().await.unwrap();
        let now = f.clock.now();

        f.connector.disable(DisableReason::TooManyErrors, now + ChronoDuration::minutes(5));
        f.connector.update_health().await;
        let health = f.connector.health.health().await;
        assert_eq!(health.components[&Component::Synchronizer].status, ComponentStatus::Degraded);
        assert!(f.connector.health.readiness().await.ready);

        f.connector.disable(DisableReason::AuthenticationError, now + ChronoDuration::hours(1));
        f.connector.update_health().await;
        let health = f.connector.health.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        let readiness = f.connector.health.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("unhealthy components: synchronizer"));
    }

    #[tokio::test]
    async fn test_run_starts_mqtt_and_reports_status() {
        let f = fixture(config());
        let (shutdown, _) = broadcast::channel(4);

        let connector = f.connector.clone();
        let tx = shutdown.clone();
        let task = tokio::spawn(async move { connector.run(tx).await });

        let mut created = None;
        for _ in 0..100 {
            if let Some(mqtt) = f.mqtt.last() {
                created = Some(mqtt);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mqtt = created.expect("MQTT client was not created");

        let options = mqtt.options.lock().unwrap().clone().unwrap();
        assert_eq!(options.agent_id, AGENT_ID);
        assert_eq!(options.password, "secret-password");

        mqtt.connected.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.connector.connected());
        assert!(f.store.metrics().iter().any(|m| m.labels.get(METRIC_NAME).map(String::as_str) == Some(AGENT_STATUS_NAME)));

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(f.api.count_resource("agent") > 0);
    }

    #[tokio::test]
    async fn test_relabel_resolves_snmp_agents() {
        let f = fixture(config());
        f.api.insert("agenttype", json!({ "id": "snmp-type", "name": "snmp", "display_name": "SNMP" }));
        f.api.insert(
            "agent",
            json!({
                "id": "snmp-agent",
                "account": "acc",
                "agent_type": "snmp-type",
                "fqdn": "switch.example.com",
            }),
        );
        f.connector.synchronizer().initialize().await.unwrap();
        f.connector.synchronizer().run_once().await.unwrap();

        let labels: Labels = [(METRIC_NAME.to_string(), "cpu_used".to_string())].into_iter().collect();
        let main = f.connector.relabel(&labels).unwrap();
        assert_eq!(main.get(META_BLEEMEO_UUID).map(String::as_str), Some(AGENT_ID));

        let mut snmp = labels.clone();
        snmp.insert(META_SNMP_TARGET.to_string(), "switch.example.com".to_string());
        let relabeled = f.connector.relabel(&snmp).unwrap();
        assert_eq!(relabeled.get(META_BLEEMEO_UUID).map(String::as_str), Some("snmp-agent"));

        snmp.insert(META_SNMP_TARGET.to_string(), "unknown.example.com".to_string());
        assert!(f.connector.relabel(&snmp).is_none());
    }

    #[tokio::test]
    async fn test_diagnostic_archive() {
        let f = fixture(config());
        f.connector.synchronizer().initialize().await.unwrap();
        f.connector.synchronizer().run_once().await.unwrap();

        let mut archive = MemoryArchive::new();
        f.connector.write_diagnostic_archive(&mut archive).unwrap();

        let page = archive.file_as_string("bleemeo-connector.txt").unwrap();
        assert!(page.contains("registration_key: regist"));
        assert!(!page.contains("registration-key-0123456789"));
        assert!(page.contains(&format!("agent_id: {}", AGENT_ID)));
        assert!(archive.file_as_string("bleemeo-cache.txt").unwrap().contains(AGENT_ID));
        assert!(archive
            .file_as_string("metric-registration-failed.txt")
            .unwrap()
            .starts_with("0 metrics failed"));
        assert_eq!(f.connector.tags(), Vec::<String>::new());
        assert!(f.connector.registration_at().is_some());
        assert!(f.cache.current_account_config().is_some());
    }
}
