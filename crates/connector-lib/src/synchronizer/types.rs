//! Entities, sync types and the contract every entity synchronizer follows

use super::execution::Execution;
use crate::models::{DisableReason, Metric, Monitor};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Kind of entity synchronized with the API.
///
/// The declaration order is the dependency order of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityName {
    Info,
    Agent,
    AccountConfig,
    ConfigItem,
    Service,
    Monitor,
    Container,
    Metric,
    Diagnostics,
}

impl EntityName {
    pub const ALL: [EntityName; 9] = [
        EntityName::Info,
        EntityName::Agent,
        EntityName::AccountConfig,
        EntityName::ConfigItem,
        EntityName::Service,
        EntityName::Monitor,
        EntityName::Container,
        EntityName::Metric,
        EntityName::Diagnostics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityName::Info => "info",
            EntityName::Agent => "agent",
            EntityName::AccountConfig => "account_config",
            EntityName::ConfigItem => "config_item",
            EntityName::Service => "service",
            EntityName::Monitor => "monitor",
            EntityName::Container => "container",
            EntityName::Metric => "metric",
            EntityName::Diagnostics => "diagnostics",
        }
    }

    /// Entities synchronized when only essential work is allowed
    pub fn is_essential(&self) -> bool {
        matches!(
            self,
            EntityName::Info | EntityName::Agent | EntityName::AccountConfig | EntityName::Metric
        )
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an entity is synchronized during one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncType {
    #[default]
    None,
    /// Reconcile against the cache
    Normal,
    /// Reload the remote listing into the cache first
    ForceCacheRefresh,
}

impl SyncType {
    pub fn is_full(&self) -> bool {
        matches!(self, SyncType::ForceCacheRefresh)
    }
}

/// Entity failures the orchestrator reacts to
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("agent don't have any configuration on the cloud platform")]
    NoConfig,

    #[error("shutdown requested due to {0}")]
    ShutdownRequested(DisableReason),

    #[error("synchronization disabled for {duration:?} due to {reason}")]
    DisableFor {
        reason: DisableReason,
        duration: Duration,
    },
}

/// A monitor ready to be probed by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMonitor {
    pub monitor: Monitor,
    /// Probe interval
    pub resolution: Duration,
    /// Creation date moved within its minute to spread probes
    pub scheduled_at: DateTime<Utc>,
}

/// Callbacks into the rest of the agent. Every method defaults to a no-op.
pub trait SynchronizerHooks: Send + Sync {
    /// The account configuration changed.
    fn update_config(&self, _name_changed: bool) {}

    /// Synchronization was disabled until `until`.
    fn disable(&self, _reason: DisableReason, _until: DateTime<Utc>) {}

    /// Registration completed and an authenticated client exists.
    fn set_initialized(&self) {}

    fn is_mqtt_connected(&self) -> bool {
        false
    }

    fn set_maintenance(&self, _maintenance: bool) {}

    fn set_mqtt_read_only(&self, _read_only: bool) {}

    fn is_mqtt_read_only(&self) -> bool {
        false
    }

    /// Thresholds of registered metrics changed.
    fn update_thresholds(&self, _metrics: &[Metric]) {}

    /// Labels derived from the agent list changed.
    fn notify_labels_update(&self) {}

    fn update_monitors(&self, _monitors: &[ScheduledMonitor]) {}
}

/// Hooks doing nothing, for a standalone synchronizer
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SynchronizerHooks for NoopHooks {}

/// One kind of entity, reconciled during a pass.
///
/// Calls happen in this order: `prepare_execution` and
/// `need_synchronization` during phase one, then `refresh_cache` and
/// `sync_remote_and_local` when the entity has something to do, and
/// `finish_execution` for every entity that was prepared.
#[async_trait]
pub trait EntitySynchronizer: Send {
    fn name(&self) -> EntityName;

    fn enabled_in_maintenance(&self) -> bool {
        false
    }

    fn enabled_in_suspended_mode(&self) -> bool {
        true
    }

    /// Returns false to skip the entity for this pass.
    async fn prepare_execution(&mut self, _execution: &Execution) -> Result<bool> {
        Ok(true)
    }

    /// Whether there is work even without an explicit request.
    async fn need_synchronization(&mut self, _execution: &Execution) -> bool {
        false
    }

    async fn refresh_cache(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()>;

    async fn sync_remote_and_local(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()>;

    fn finish_execution(&mut self, _execution: &Execution) {}
}
