//! Synchronization of the agent state with the Bleemeo API
//!
//! This module provides:
//! - Registration of the agent and construction of the authenticated client
//! - One synchronizer per entity, run in dependency order during a pass
//! - Full resynchronization on a jittered interval and after repeated errors
//! - Error backoff and temporary disabling of the synchronization

mod account_config;
mod agent;
pub mod config;
mod config_items;
mod containers;
pub(crate) mod context;
mod diagnostics;
pub mod execution;
mod info;
pub mod metrics;
mod monitors;
pub mod registration;
mod services;
pub mod types;


pub use config::SynchronizerConfig;
pub use execution::Execution;
pub use metrics::{failure_kind_from_body, prioritize_and_filter, MetricComparator, AGENT_STATUS_NAME};
pub use monitors::apply_jitter_to_monitor_creation_date;
pub use registration::{ensure_registered, AgentCredentials};
pub use types::{
    EntityName, EntitySynchronizer, NoopHooks, ScheduledMonitor, SyncError, SyncType, SynchronizerHooks,
};

use crate::cache::Cache;
use crate::client::{is_authentication_error, ClientError, ClientFactory, RawClient};
use crate::clock::Clock;
use crate::diagnostic::{DiagnosticFile, DiagnosticSource};
use crate::discovery::{ContainerRuntime, Discovery};
use crate::models::DisableReason;
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::state::State;
use crate::store::MetricStore;
use account_config::AccountConfigSync;
use agent::AgentSync;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use config::to_chrono;
use config_items::ConfigItemSync;
use containers::ContainerSync;
use context::{SharedState, SyncContext};
use diagnostics::DiagnosticSync;
use info::InfoSync;
use metrics::MetricSync;
use monitors::MonitorSync;
use services::ServiceSync;
use rand::Rng;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

/// Successive failed passes after which every entity reloads its cache
const SELF_HEALING_ERRORS: u32 = 3;

/// Every this many successive errors, synchronization is disabled for a while
const DISABLE_AFTER_ERRORS: u32 = 7;

const ERROR_BACKOFF_BASE_SECS: f64 = 15.0;
const ERROR_BACKOFF_FACTOR: f64 = 1.55;

/// List a resource, skipping records that don't decode.
pub(crate) async fn list_records<T: DeserializeOwned>(
    client: &dyn RawClient,
    resource: &str,
    params: &[(&str, &str)],
) -> Result<Vec<T>, ClientError> {
    let records = client.iter(resource, params).await?;

    Ok(records
        .into_iter()
        .filter_map(|raw| match serde_json::from_value(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(resource = resource, error = %e, "Skipping a record that failed to decode");
                None
            }
        })
        .collect())
}

/// Delay before the next pass after `successive_errors` failed ones, with 10% jitter.
pub fn error_backoff(successive_errors: u32, max: Duration) -> Duration {
    let exponent = successive_errors.saturating_sub(1).min(32) as i32;
    let delay = (ERROR_BACKOFF_BASE_SECS * ERROR_BACKOFF_FACTOR.powi(exponent)).min(max.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);

    Duration::from_secs_f64(delay * jitter)
}

/// The entity synchronizers, in pass order
enum Entity {
    Info(InfoSync),
    Agent(AgentSync),
    AccountConfig(AccountConfigSync),
    ConfigItem(ConfigItemSync),
    Service(ServiceSync),
    Monitor(MonitorSync),
    Container(ContainerSync),
    Metric(MetricSync),
    Diagnostics(DiagnosticSync),
}

impl Entity {
    fn all(ctx: &Arc<SyncContext>) -> Vec<Entity> {
        EntityName::ALL
            .iter()
            .map(|name| match name {
                EntityName::Info => Entity::Info(InfoSync::new(ctx.clone())),
                EntityName::Agent => Entity::Agent(AgentSync::new(ctx.clone())),
                EntityName::AccountConfig => Entity::AccountConfig(AccountConfigSync::new(ctx.clone())),
                EntityName::ConfigItem => Entity::ConfigItem(ConfigItemSync::new(ctx.clone())),
                EntityName::Service => Entity::Service(ServiceSync::new(ctx.clone())),
                EntityName::Monitor => Entity::Monitor(MonitorSync::new(ctx.clone())),
                EntityName::Container => Entity::Container(ContainerSync::new(ctx.clone())),
                EntityName::Metric => Entity::Metric(MetricSync::new(ctx.clone())),
                EntityName::Diagnostics => Entity::Diagnostics(DiagnosticSync::new(ctx.clone())),
            })
            .collect()
    }

    fn as_sync(&mut self) -> &mut dyn EntitySynchronizer {
        match self {
            Entity::Info(s) => s,
            Entity::Agent(s) => s,
            Entity::AccountConfig(s) => s,
            Entity::ConfigItem(s) => s,
            Entity::Service(s) => s,
            Entity::Monitor(s) => s,
            Entity::Container(s) => s,
            Entity::Metric(s) => s,
            Entity::Diagnostics(s) => s,
        }
    }
}

/// Collaborators of the synchronizer
pub struct SynchronizerOptions {
    pub config: SynchronizerConfig,
    pub cache: Arc<Cache>,
    pub state: Arc<State>,
    pub client_factory: Arc<dyn ClientFactory>,
    pub discovery: Arc<dyn Discovery>,
    pub container_runtime: Option<Arc<dyn ContainerRuntime>>,
    pub store: Arc<dyn MetricStore>,
    pub diagnostics: Option<Arc<dyn DiagnosticSource>>,
    pub hooks: Arc<dyn SynchronizerHooks>,
    pub clock: Arc<dyn Clock>,
}

/// Scheduling state carried between passes
#[derive(Debug, Clone)]
struct LoopState {
    last_sync: Option<DateTime<Utc>>,
    next_full_sync: DateTime<Utc>,
    successive_errors: u32,
    /// The next pass only synchronizes essential entities
    only_essential: bool,
    /// Requests for the next pass, entity -> force cache refresh
    requests: HashMap<EntityName, bool>,
    disabled_until: Option<DateTime<Utc>>,
    disable_reason: Option<DisableReason>,
}

/// Summary of one pass
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Entities synchronized without error
    pub synchronized: Vec<EntityName>,
    /// Entities that failed
    pub failed: Vec<EntityName>,
    pub full: bool,
    pub only_essential: bool,
    pub authentication_error: bool,
    /// Disable requested by an entity
    pub disable: Option<(DisableReason, Duration)>,
}

impl PassReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.disable.is_none()
    }

    /// Whether any entity ran at all
    pub fn ran(&self) -> bool {
        !self.synchronized.is_empty() || !self.failed.is_empty()
    }
}

struct Runtime {
    ctx: Arc<SyncContext>,
    client: Arc<dyn RawClient>,
    entities: Vec<Entity>,
}

/// Orchestrates the entity synchronizers
pub struct Synchronizer {
    options: SynchronizerOptions,
    shared: Arc<SharedState>,
    state: Mutex<LoopState>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
    agent_id: Mutex<Option<String>>,
    wake: Notify,
    metrics: SyncMetrics,
    started_at: DateTime<Utc>,
}

impl Synchronizer {
    pub fn new(options: SynchronizerOptions) -> Self {
        let now = options.clock.now();

        Self {
            state: Mutex::new(LoopState {
                last_sync: None,
                next_full_sync: now,
                successive_errors: 0,
                only_essential: false,
                requests: HashMap::new(),
                disabled_until: None,
                disable_reason: None,
            }),
            options,
            shared: Arc::new(SharedState::default()),
            runtime: tokio::sync::Mutex::new(None),
            agent_id: Mutex::new(None),
            wake: Notify::new(),
            metrics: SyncMetrics::new(),
            started_at: now,
        }
    }

    fn loop_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.options.clock.now()
    }

    /// Agent ID, once registered
    pub fn agent_id(&self) -> Option<String> {
        self.agent_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.options.cache
    }

    /// Register if needed and build the authenticated client. Retries until it succeeds.
    pub async fn initialize(&self) -> Result<()> {
        let mut attempts = 0;

        let credentials = loop {
            match ensure_registered(&self.options.config, &self.options.state, self.options.client_factory.as_ref())
                .await
            {
                Ok(credentials) => break credentials,
                Err(e) => {
                    attempts += 1;
                    let delay = error_backoff(attempts, self.options.config.max_error_backoff);
                    warn!(
                        error = %format!("{:#}", e),
                        attempts = attempts,
                        retry_in_secs = delay.as_secs(),
                        "Agent registration failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.setup(credentials)?;
        Ok(())
    }

    fn setup(&self, credentials: AgentCredentials) -> Result<()> {
        let client = self
            .options
            .client_factory
            .authenticated(&credentials.agent_id, &credentials.password)
            .context("Failed to build the API client")?;

        let ctx = Arc::new(SyncContext {
            config: self.options.config.clone(),
            agent_id: credentials.agent_id.clone(),
            cache: self.options.cache.clone(),
            state: self.options.state.clone(),
            clock: self.options.clock.clone(),
            discovery: self.options.discovery.clone(),
            container_runtime: self.options.container_runtime.clone(),
            store: self.options.store.clone(),
            diagnostics: self.options.diagnostics.clone(),
            hooks: self.options.hooks.clone(),
            shared: self.shared.clone(),
            metrics: self.metrics.clone(),
            started_at: self.started_at,
        });

        let entities = Entity::all(&ctx);

        // The runtime lock is free before the loop starts
        match self.runtime.try_lock() {
            Ok(mut runtime) => {
                *runtime = Some(Runtime {
                    ctx,
                    client,
                    entities,
                })
            }
            Err(_) => anyhow::bail!("synchronizer is already running"),
        }

        if credentials.newly_registered {
            StructuredLogger::new(&credentials.agent_id)
                .log_registration(&self.options.config.account_id, &self.options.config.fqdn);
            self.loop_state().only_essential = true;
        }

        *self.agent_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials.agent_id);
        self.options.hooks.set_initialized();
        Ok(())
    }

    /// Run passes until shutdown. Only a missing account configuration stops it early.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let result = tokio::select! {
            result = self.run_loop() => result,
            _ = shutdown.recv() => {
                info!("Synchronizer shutting down");
                Ok(())
            }
        };

        self.save_cache();
        result
    }

    async fn run_loop(&self) -> Result<()> {
        if self.agent_id().is_none() {
            self.initialize().await?;
        }

        loop {
            self.wait_while_disabled().await;

            let report = self.run_once().await?;
            let successive_errors = self.loop_state().successive_errors;

            if let Some((reason, duration)) = report.disable {
                self.disable_for(reason, duration);
                continue;
            }

            if report.is_success() {
                tokio::time::sleep(self.options.config.min_delay_between_passes).await;
                continue;
            }

            let delay = error_backoff(successive_errors, self.options.config.max_error_backoff);

            if report.authentication_error {
                self.disable_for(DisableReason::AuthenticationError, delay);
            } else if successive_errors % DISABLE_AFTER_ERRORS == DISABLE_AFTER_ERRORS - 1 {
                self.disable_for(DisableReason::TooManyErrors, delay);
            } else {
                debug!(
                    successive_errors = successive_errors,
                    retry_in_secs = delay.as_secs(),
                    "Synchronization failed, waiting before the next pass"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn wait_while_disabled(&self) {
        loop {
            let until = self.loop_state().disabled_until;
            let Some(until) = until else {
                return;
            };

            let now = self.now();
            if until <= now {
                let mut state = self.loop_state();
                state.disabled_until = None;
                state.disable_reason = None;
                drop(state);

                self.metrics.set_disabled(false);
                info!("Synchronization with the Bleemeo API re-enabled");
                return;
            }

            let remaining = (until - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Disable the synchronization and tell the rest of the agent.
    fn disable_for(&self, reason: DisableReason, duration: Duration) {
        let until = self.now() + to_chrono(duration);
        self.disable(reason, until);

        if let Some(agent_id) = self.agent_id() {
            StructuredLogger::new(agent_id).log_disabled(&reason.to_string(), &until.to_rfc3339());
        }
        self.options.hooks.disable(reason, until);
    }

    fn save_cache(&self) {
        let cache = &self.options.cache;
        if !cache.is_dirty() {
            return;
        }

        if let Err(e) = cache.save(&self.options.state) {
            error!(error = %format!("{:#}", e), "Failed to save the cache");
        }
    }

    /// Run one pass. Errors are only returned for fatal conditions.
    pub async fn run_once(&self) -> Result<PassReport> {
        let mut guard = self.runtime.lock().await;
        let runtime = guard.as_mut().context("synchronizer is not initialized")?;
        let ctx = runtime.ctx.clone();

        let started = Instant::now();
        let now = ctx.now();
        let state = {
            let mut state = self.loop_state();
            let snapshot = state.clone();
            state.requests.clear();
            snapshot
        };

        let full_deadline_reached = now >= state.next_full_sync;
        let force_all = full_deadline_reached || state.successive_errors == SELF_HEALING_ERRORS;
        let only_essential = state.only_essential;
        let maintenance = ctx.shared.is_maintenance();
        let suspended = ctx.shared.is_suspended();

        let execution = Execution::new(runtime.client.clone(), now, state.last_sync, state.successive_errors)
            .with_only_essential(only_essential)
            .with_force_cache_refresh(force_all)
            .with_maintenance(maintenance)
            .with_requests(state.requests.clone());

        let mut report = PassReport {
            full: force_all,
            only_essential,
            ..Default::default()
        };

        // Phase one: which entities take part and whether they have work
        let mut prepared: Vec<(usize, bool)> = Vec::new();
        for (idx, entity) in runtime.entities.iter_mut().enumerate() {
            let sync = entity.as_sync();
            let name = sync.name();

            if (maintenance && !sync.enabled_in_maintenance())
                || (suspended && !sync.enabled_in_suspended_mode())
                || (only_essential && !name.is_essential())
            {
                continue;
            }

            match sync.prepare_execution(&execution).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(entity = %name, error = %format!("{:#}", e), "Failed to prepare synchronization");
                    self.metrics.inc_entity_error(name.as_str());
                    report.failed.push(name);
                    continue;
                }
            }

            let need = sync.need_synchronization(&execution).await;
            prepared.push((idx, need));
        }

        let requested = execution.start_synchronizing();

        // Requests for entities skipped this pass are kept
        let mut carried: HashMap<EntityName, bool> = requested.clone();
        for (idx, _) in &prepared {
            carried.remove(&runtime.entities[*idx].as_sync().name());
        }

        // Phase two: refresh and reconcile, in order
        let mut fatal: Option<anyhow::Error> = None;
        for (idx, need) in &prepared {
            let sync = runtime.entities[*idx].as_sync();
            let name = sync.name();

            let sync_type = if force_all {
                SyncType::ForceCacheRefresh
            } else {
                match requested.get(&name) {
                    Some(true) => SyncType::ForceCacheRefresh,
                    Some(false) => SyncType::Normal,
                    None if *need => SyncType::Normal,
                    None => SyncType::None,
                }
            };

            if sync_type == SyncType::None {
                continue;
            }

            let result = match sync.refresh_cache(&execution, sync_type).await {
                Ok(()) => sync.sync_remote_and_local(&execution, sync_type).await,
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(()) => {
                    report.synchronized.push(name);
                    continue;
                }
                Err(e) => e,
            };

            report.failed.push(name);
            self.metrics.inc_entity_error(name.as_str());

            match err.downcast_ref::<SyncError>() {
                Some(SyncError::NoConfig) => {
                    fatal = Some(err);
                    break;
                }
                Some(SyncError::ShutdownRequested(reason)) => {
                    warn!(entity = %name, error = %err, "Synchronization must stop");
                    report.disable = Some((*reason, self.options.config.too_old_disable));
                    break;
                }
                Some(SyncError::DisableFor { reason, duration }) => {
                    report.disable = Some((*reason, *duration));
                    break;
                }
                None => {
                    if is_authentication_error(&err) {
                        report.authentication_error = true;
                    }
                    warn!(entity = %name, error = %format!("{:#}", err), "Synchronization failed");
                }
            }
        }

        for (idx, _) in &prepared {
            let sync = runtime.entities[*idx].as_sync();
            sync.finish_execution(&execution);

            // A request is only consumed by a successful run
            let name = sync.name();
            if !report.synchronized.contains(&name) {
                if let Some(force) = requested.get(&name) {
                    carried.insert(name, *force);
                }
            }
        }

        let outcome = execution.into_outcome();
        if outcome.update_thresholds {
            ctx.hooks.update_thresholds(&ctx.cache.metrics());
        }
        if outcome.notify_labels {
            ctx.hooks.notify_labels_update();
        }

        self.save_cache();

        let end = ctx.now();
        let success = report.is_success() && fatal.is_none();
        {
            let mut state = self.loop_state();
            for (entity, force) in outcome.next_requests.into_iter().chain(carried) {
                let entry = state.requests.entry(entity).or_insert(false);
                *entry = *entry || force;
            }

            if only_essential {
                state.only_essential = false;
                for entity in EntityName::ALL {
                    state.requests.entry(entity).or_insert(false);
                }
            }

            if success {
                state.successive_errors = 0;
                if report.ran() {
                    state.last_sync = Some(end);
                }
                if full_deadline_reached {
                    state.next_full_sync = end + self.full_sync_delay();
                }
            } else {
                state.successive_errors += 1;
            }

            self.metrics.set_successive_errors(state.successive_errors);
        }

        if report.ran() {
            let names: Vec<&str> = report
                .synchronized
                .iter()
                .chain(report.failed.iter())
                .map(EntityName::as_str)
                .collect();
            StructuredLogger::new(ctx.agent_id.as_str()).log_sync_completed(
                &names,
                report.full,
                started.elapsed().as_millis() as u64,
                report.failed.len(),
            );
            self.metrics.observe_sync(success, started.elapsed().as_secs_f64());
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn full_sync_delay(&self) -> chrono::Duration {
        let jitter_max = self.options.config.full_sync_jitter.as_secs_f64();
        let jitter = if jitter_max > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_max)
        } else {
            0.0
        };

        to_chrono(self.options.config.full_sync_interval) + to_chrono(Duration::from_secs_f64(jitter))
    }

    fn request(&self, entity: EntityName, force_cache_refresh: bool) {
        {
            let mut state = self.loop_state();
            let entry = state.requests.entry(entity).or_insert(false);
            *entry = *entry || force_cache_refresh;
        }
        self.wake.notify_one();
    }

    /// Containers changed on the host.
    pub fn update_containers(&self) {
        self.request(EntityName::Container, false);
    }

    /// Maintenance or version information may have changed on the API.
    pub fn update_info(&self) {
        self.request(EntityName::Info, false);
    }

    /// Monitors of the account changed.
    pub fn update_monitors(&self) {
        self.request(EntityName::Monitor, true);
    }

    /// Metrics or their thresholds changed on the API.
    pub fn update_metrics(&self) {
        self.request(EntityName::Metric, true);
    }

    /// The agent or account configuration changed on the API.
    pub fn notify_config_update(&self) {
        self.request(EntityName::Agent, true);
        self.request(EntityName::AccountConfig, true);
        self.request(EntityName::Metric, true);
    }

    /// Upload an on-demand diagnostic at the next pass, replacing any pending one.
    pub fn schedule_diagnostic_upload(&self, filename: &str, request_token: &str, content: Vec<u8>) {
        self.shared
            .set_on_demand_diagnostic(DiagnosticFile::on_demand(filename, request_token, content));
        self.request(EntityName::Diagnostics, false);
    }

    pub fn set_maintenance(&self, maintenance: bool) {
        let previous = self.shared.set_maintenance(maintenance);
        if previous && !maintenance {
            for entity in EntityName::ALL {
                self.request(entity, true);
            }
        }
    }

    pub fn is_maintenance(&self) -> bool {
        self.shared.is_maintenance()
    }

    /// In suspended mode, only entities tolerating it are synchronized.
    pub fn set_suspended_mode(&self, suspended: bool) {
        self.shared.set_suspended(suspended);
        self.wake.notify_one();
    }

    /// Disable until `until`. An earlier deadline never shortens a current one.
    pub fn disable(&self, reason: DisableReason, until: DateTime<Utc>) {
        let mut state = self.loop_state();
        if state.disabled_until.map(|current| current >= until).unwrap_or(false) {
            return;
        }

        state.disabled_until = Some(until);
        state.disable_reason = Some(reason);
        drop(state);

        self.metrics.set_disabled(true);
    }

    /// Lift a disable, only if it was for `reason`.
    pub fn clear_disable(&self, reason: DisableReason) {
        let mut state = self.loop_state();
        if state.disable_reason != Some(reason) {
            return;
        }

        state.disabled_until = None;
        state.disable_reason = None;
        drop(state);

        self.metrics.set_disabled(false);
        self.wake.notify_one();
    }

    /// Current disable reason and deadline
    pub fn disabled_until(&self) -> Option<(DisableReason, DateTime<Utc>)> {
        let state = self.loop_state();
        match (state.disable_reason, state.disabled_until) {
            (Some(reason), Some(until)) if until > self.now() => Some((reason, until)),
            _ => None,
        }
    }

    pub fn successive_errors(&self) -> u32 {
        self.loop_state().successive_errors
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.loop_state().last_sync
    }

    pub fn next_full_sync(&self) -> DateTime<Utc> {
        self.loop_state().next_full_sync
    }

    /// Force the next full pass deadline.
    pub fn set_next_full_sync(&self, at: DateTime<Utc>) {
        self.loop_state().next_full_sync = at;
    }

    /// Text summary for diagnostic archives.
    pub fn diagnostic_page(&self) -> String {
        let state = self.loop_state().clone();
        let mut page = String::new();

        let _ = writeln!(page, "agent_id: {}", self.agent_id().unwrap_or_default());
        let _ = writeln!(
            page,
            "last_sync: {}",
            state.last_sync.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
        );
        let _ = writeln!(page, "next_full_sync: {}", state.next_full_sync.to_rfc3339());
        let _ = writeln!(page, "successive_errors: {}", state.successive_errors);
        let _ = writeln!(page, "only_essential: {}", state.only_essential);
        let _ = writeln!(page, "maintenance: {}", self.shared.is_maintenance());
        let _ = writeln!(page, "suspended: {}", self.shared.is_suspended());

        match self.disabled_until() {
            Some((reason, until)) => {
                let _ = writeln!(page, "disabled: until {} due to {}", until.to_rfc3339(), reason);
            }
            None => {
                let _ = writeln!(page, "disabled: no");
            }
        }

        let mut pending: Vec<String> = state
            .requests
            .iter()
            .map(|(entity, force)| format!("{}{}", entity, if *force { " (full)" } else { "" }))
            .collect();
        pending.sort();
        let _ = writeln!(page, "pending requests: {}", pending.join(", "));

        page
    }
}
