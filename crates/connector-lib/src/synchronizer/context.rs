//! Dependencies shared by the entity synchronizers

use super::config::{to_chrono, SynchronizerConfig};
use super::types::SynchronizerHooks;
use crate::cache::Cache;
use crate::clock::Clock;
use crate::diagnostic::{DiagnosticFile, DiagnosticSource};
use crate::discovery::{ContainerRuntime, Discovery};
use crate::observability::SyncMetrics;
use crate::state::State;
use crate::store::MetricStore;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Shared {
    maintenance: bool,
    suspended: bool,
    on_demand_diagnostic: Option<DiagnosticFile>,
}

/// Flags written by the public API and read by a pass
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    inner: Mutex<Shared>,
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_maintenance(&self) -> bool {
        self.lock().maintenance
    }

    /// Returns the previous value.
    pub fn set_maintenance(&self, maintenance: bool) -> bool {
        std::mem::replace(&mut self.lock().maintenance, maintenance)
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.lock().suspended = suspended;
    }

    pub fn on_demand_diagnostic(&self) -> Option<DiagnosticFile> {
        self.lock().on_demand_diagnostic.clone()
    }

    pub fn set_on_demand_diagnostic(&self, diagnostic: DiagnosticFile) {
        self.lock().on_demand_diagnostic = Some(diagnostic);
    }

    /// Forget the on-demand diagnostic if it is still `filename`.
    pub fn clear_on_demand_diagnostic(&self, filename: &str) {
        let mut shared = self.lock();
        if shared
            .on_demand_diagnostic
            .as_ref()
            .map(|d| d.filename == filename)
            .unwrap_or(false)
        {
            shared.on_demand_diagnostic = None;
        }
    }
}

/// Everything an entity synchronizer needs besides the pass itself
pub(crate) struct SyncContext {
    pub config: SynchronizerConfig,
    pub agent_id: String,
    pub cache: Arc<Cache>,
    pub state: Arc<State>,
    pub clock: Arc<dyn Clock>,
    pub discovery: Arc<dyn Discovery>,
    pub container_runtime: Option<Arc<dyn ContainerRuntime>>,
    pub store: Arc<dyn MetricStore>,
    pub diagnostics: Option<Arc<dyn DiagnosticSource>>,
    pub hooks: Arc<dyn SynchronizerHooks>,
    pub shared: Arc<SharedState>,
    pub metrics: SyncMetrics,
    /// Start of the process, for uptime based decisions
    pub started_at: DateTime<Utc>,
}

impl SyncContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn uptime(&self) -> chrono::Duration {
        self.now() - self.started_at
    }

    pub fn grace(&self) -> chrono::Duration {
        to_chrono(self.config.metric_deactivation_grace)
    }
}
