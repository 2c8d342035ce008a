//! State of a single synchronization pass

use super::types::EntityName;
use crate::client::RawClient;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Requests {
    synchronizing: bool,
    /// Entity -> force cache refresh, for this pass
    current: HashMap<EntityName, bool>,
    /// Entity -> force cache refresh, for the next pass
    next: HashMap<EntityName, bool>,
    update_thresholds: bool,
    notify_labels: bool,
}

fn merge(map: &mut HashMap<EntityName, bool>, entity: EntityName, force_cache_refresh: bool) {
    let entry = map.entry(entity).or_insert(false);
    *entry = *entry || force_cache_refresh;
}

/// What a pass leaves to the next one
#[derive(Debug, Default)]
pub(crate) struct ExecutionOutcome {
    pub next_requests: HashMap<EntityName, bool>,
    pub update_thresholds: bool,
    pub notify_labels: bool,
}

/// One pass of the orchestrator.
///
/// Entities receive it by shared reference; requests raised while running
/// go through an internal lock.
pub struct Execution {
    client: Arc<dyn RawClient>,
    only_essential: bool,
    force_cache_refresh: bool,
    started_at: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
    successive_errors: u32,
    maintenance: bool,
    requests: Mutex<Requests>,
}

impl Execution {
    pub(crate) fn new(
        client: Arc<dyn RawClient>,
        started_at: DateTime<Utc>,
        last_sync: Option<DateTime<Utc>>,
        successive_errors: u32,
    ) -> Self {
        Self {
            client,
            only_essential: false,
            force_cache_refresh: false,
            started_at,
            last_sync,
            successive_errors,
            maintenance: false,
            requests: Mutex::new(Requests::default()),
        }
    }

    pub(crate) fn with_only_essential(mut self, only_essential: bool) -> Self {
        self.only_essential = only_essential;
        self
    }

    pub(crate) fn with_force_cache_refresh(mut self, force: bool) -> Self {
        self.force_cache_refresh = force;
        self
    }

    pub(crate) fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub(crate) fn with_requests(self, requests: HashMap<EntityName, bool>) -> Self {
        self.lock().current = requests;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Requests> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn client(&self) -> &dyn RawClient {
        self.client.as_ref()
    }

    pub fn is_only_essential(&self) -> bool {
        self.only_essential
    }

    /// Whether every entity reloads its cache during this pass.
    pub fn is_force_cache_refresh(&self) -> bool {
        self.force_cache_refresh
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// End of the last fully successful pass
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn successive_errors(&self) -> u32 {
        self.successive_errors
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance
    }

    /// Ask for `entity` to be synchronized. Before entities start running
    /// the request applies to this pass, afterwards to the next one.
    pub fn request_synchronization(&self, entity: EntityName, force_cache_refresh: bool) {
        let mut requests = self.lock();
        if requests.synchronizing {
            merge(&mut requests.next, entity, force_cache_refresh);
        } else {
            merge(&mut requests.current, entity, force_cache_refresh);
        }
    }

    pub fn request_synchronization_for_all(&self, force_cache_refresh: bool) {
        for entity in EntityName::ALL {
            self.request_synchronization(entity, force_cache_refresh);
        }
    }

    /// Explicit request for this pass: `Some(force_cache_refresh)` when any.
    pub fn is_synchronization_requested(&self, entity: EntityName) -> Option<bool> {
        self.lock().current.get(&entity).copied()
    }

    pub fn request_update_thresholds(&self) {
        self.lock().update_thresholds = true;
    }

    pub fn request_notify_labels_update(&self) {
        self.lock().notify_labels = true;
    }

    /// End of phase one: later requests go to the next pass.
    pub(crate) fn start_synchronizing(&self) -> HashMap<EntityName, bool> {
        let mut requests = self.lock();
        requests.synchronizing = true;
        requests.current.clone()
    }

    pub(crate) fn into_outcome(self) -> ExecutionOutcome {
        let requests = self.requests.into_inner().unwrap_or_else(|e| e.into_inner());
        ExecutionOutcome {
            next_requests: requests.next,
            update_thresholds: requests.update_thresholds,
            notify_labels: requests.notify_labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockApi;

    fn execution() -> Execution {
        Execution::new(Arc::new(MockApi::new()), Utc::now(), None, 0)
    }

    #[test]
    fn test_requests_before_synchronizing_apply_to_current_pass() {
        let exec = execution();
        exec.request_synchronization(EntityName::Metric, false);
        exec.request_synchronization(EntityName::Metric, true);
        exec.request_synchronization(EntityName::Metric, false);

        assert_eq!(exec.is_synchronization_requested(EntityName::Metric), Some(true));

        let current = exec.start_synchronizing();
        assert_eq!(current.get(&EntityName::Metric), Some(&true));
        assert!(exec.into_outcome().next_requests.is_empty());
    }

    #[test]
    fn test_requests_while_synchronizing_go_to_next_pass() {
        let exec = execution();
        exec.start_synchronizing();

        exec.request_synchronization(EntityName::Service, true);
        exec.request_update_thresholds();

        assert_eq!(exec.is_synchronization_requested(EntityName::Service), None);

        let outcome = exec.into_outcome();
        assert_eq!(outcome.next_requests.get(&EntityName::Service), Some(&true));
        assert!(outcome.update_thresholds);
        assert!(!outcome.notify_labels);
    }

    #[test]
    fn test_request_all() {
        let exec = execution().with_requests(HashMap::from([(EntityName::Agent, true)]));
        exec.request_synchronization_for_all(false);

        let current = exec.start_synchronizing();
        assert_eq!(current.len(), EntityName::ALL.len());
        assert_eq!(current.get(&EntityName::Agent), Some(&true));
        assert_eq!(current.get(&EntityName::Metric), Some(&false));
    }
}
