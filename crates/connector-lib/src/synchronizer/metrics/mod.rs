//! Metrics of the local store mirrored on the API
//!
//! This module provides:
//! - Registration of new metrics, by priority and within a per-pass budget
//! - Reactivation of deactivated metrics seen again
//! - Deactivation of metrics no longer seen for the grace period
//! - Failure records so rejected metrics don't hot-loop on the API

mod comparator;

pub use comparator::{prioritize_and_filter, MetricComparator};

use super::context::SyncContext;
use super::execution::Execution;
use super::list_records;
use super::types::{EntityName, EntitySynchronizer, SyncType};
use crate::client::{ClientError, RawClientExt};
use crate::labels::{from_pairs, labels_to_text, metric_name, Labels, INSTANCE_UUID, ITEM, METRIC_NAME, SCRAPER};
use crate::models::{FailureKind, Metric, MetricRegistration};
use crate::store::Annotations;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const METRIC_FIELDS: &str = "id,agent,labels_text,service,container,status_of,threshold_low_warning,\
threshold_low_critical,threshold_high_warning,threshold_high_critical,unit,unit_text,deactivated_at,\
first_seen_at,alerting_rule,promql_query,is_user_promql_alerting_rule";

/// Heartbeat metric of the agent, always registered
pub const AGENT_STATUS_NAME: &str = "agent_status";

/// (agent ID, labels text), the identity of a metric on the API
type MetricKey = (String, String);

/// A metric observed locally and its resolved identity
#[derive(Debug, Clone)]
struct LocalCandidate {
    agent_id: String,
    labels: Labels,
    labels_text: String,
    annotations: Annotations,
}

impl LocalCandidate {
    fn key(&self) -> MetricKey {
        (self.agent_id.clone(), self.labels_text.clone())
    }
}

fn metric_key(metric: &Metric) -> MetricKey {
    (metric.agent_id.clone(), metric.labels_text.clone())
}

/// Classify an API rejection from its body.
pub fn failure_kind_from_body(body: &str) -> FailureKind {
    let lower = body.to_lowercase();

    if lower.contains("not whitelisted") || lower.contains("not in allow-list") {
        FailureKind::AllowList
    } else if lower.contains("too many") && lower.contains("metrics") {
        FailureKind::TooManyMetric
    } else {
        FailureKind::Unknown
    }
}

/// API references of a metric, resolved from its annotations
#[derive(Debug, Default)]
struct References {
    service: String,
    container: String,
    status_of: String,
}

/// Entity a metric waits for before it can be registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MissingDependency(EntityName);

pub(crate) struct MetricSync {
    ctx: Arc<SyncContext>,
    local: Vec<LocalCandidate>,
    /// When each metric was first observed by this process
    first_seen: HashMap<MetricKey, DateTime<Utc>>,
    failures: HashMap<String, MetricRegistration>,
    failures_changed: bool,
}

impl MetricSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            local: Vec::new(),
            first_seen: HashMap::new(),
            failures: HashMap::new(),
            failures_changed: false,
        }
    }

    fn agent_status_labels(&self) -> Labels {
        from_pairs([(METRIC_NAME, AGENT_STATUS_NAME), (INSTANCE_UUID, self.ctx.agent_id.as_str())])
    }

    /// Metrics pushed during the grace period, plus the agent heartbeat.
    fn local_metrics(&self) -> Vec<LocalCandidate> {
        let since = self.ctx.now() - self.ctx.grace();
        let mut seen: HashSet<MetricKey> = HashSet::new();

        let status = self.agent_status_labels();
        let mut local = vec![LocalCandidate {
            agent_id: self.ctx.agent_id.clone(),
            labels_text: labels_to_text(&status),
            labels: status,
            annotations: Annotations::default(),
        }];
        seen.insert(local[0].key());

        for metric in self.ctx.store.metrics() {
            if metric.last_seen < since {
                continue;
            }

            let agent_id = if metric.annotations.bleemeo_agent_id.is_empty() {
                self.ctx.agent_id.clone()
            } else {
                metric.annotations.bleemeo_agent_id.clone()
            };

            let candidate = LocalCandidate {
                agent_id,
                labels_text: labels_to_text(&metric.labels),
                labels: metric.labels,
                annotations: metric.annotations,
            };

            if seen.insert(candidate.key()) {
                local.push(candidate);
            }
        }

        local
    }

    fn cached_by_key(&self) -> HashMap<MetricKey, Metric> {
        self.ctx
            .cache
            .metrics()
            .into_iter()
            .map(|m| (metric_key(&m), m))
            .collect()
    }

    /// Whether a registration may be attempted given its failure record.
    fn can_retry(&self, labels_text: &str, full: bool, now: DateTime<Utc>) -> bool {
        let Some(failure) = self.failures.get(labels_text) else {
            return true;
        };

        if full {
            return true;
        }

        if failure.last_fail_kind.is_permanent() {
            return false;
        }

        failure.fail_counter < self.ctx.config.unknown_failure_max_retries && now >= failure.retry_after()
    }

    /// Local metrics absent from the cache or deactivated there, and allowed to retry.
    fn pending_registrations(&self, full: bool) -> Vec<LocalCandidate> {
        let cached = self.cached_by_key();
        let now = self.ctx.now();

        self.local
            .iter()
            .filter(|c| cached.get(&c.key()).map(|m| !m.is_active()).unwrap_or(true))
            .filter(|c| self.can_retry(&c.labels_text, full, now))
            .cloned()
            .collect()
    }

    fn is_owned(&self, metric: &Metric) -> bool {
        if metric.agent_id == self.ctx.agent_id {
            return true;
        }

        let scraper = &self.ctx.config.blackbox_scraper_name;
        !scraper.is_empty() && metric.labels().get(SCRAPER) == Some(scraper)
    }

    /// Active cached metrics this agent owns that are no longer observed.
    fn pending_deactivations(&self) -> Vec<Metric> {
        let local: HashSet<MetricKey> = self.local.iter().map(LocalCandidate::key).collect();
        let uptime_over_grace = self.ctx.uptime() > self.ctx.grace();

        self.ctx
            .cache
            .metrics()
            .into_iter()
            .filter(|m| m.is_active())
            .filter(|m| self.is_owned(m))
            .filter(|m| metric_name(&m.labels()) != AGENT_STATUS_NAME)
            .filter(|m| !local.contains(&metric_key(m)))
            .filter(|m| uptime_over_grace || self.first_seen.contains_key(&metric_key(m)))
            .collect()
    }

    fn resolve(&self, candidate: &LocalCandidate) -> Result<References, MissingDependency> {
        let annotations = &candidate.annotations;
        let mut refs = References::default();

        if !annotations.service_name.is_empty() {
            refs.service = self
                .ctx
                .cache
                .services()
                .into_iter()
                .find(|s| {
                    s.agent_id == self.ctx.agent_id
                        && s.label == annotations.service_name
                        && s.instance == annotations.service_instance
                })
                .map(|s| s.id)
                .ok_or(MissingDependency(EntityName::Service))?;
        }

        if !annotations.container_id.is_empty() {
            refs.container = self
                .ctx
                .cache
                .containers()
                .into_iter()
                .find(|c| c.container_id == annotations.container_id && c.deleted_at.is_none())
                .map(|c| c.id)
                .ok_or(MissingDependency(EntityName::Container))?;
        }

        if !annotations.status_of.is_empty() {
            refs.status_of = self
                .cached_by_key()
                .get(&(candidate.agent_id.clone(), annotations.status_of.clone()))
                .filter(|m| m.is_active())
                .map(|m| m.id.clone())
                .ok_or(MissingDependency(EntityName::Metric))?;
        }

        Ok(refs)
    }

    fn payload(&self, candidate: &LocalCandidate, refs: &References) -> Value {
        let first_seen = self
            .first_seen
            .get(&candidate.key())
            .copied()
            .unwrap_or_else(|| self.ctx.now());

        let mut body = Map::new();
        body.insert("agent".to_string(), json!(candidate.agent_id));
        body.insert("labels_text".to_string(), json!(candidate.labels_text));
        body.insert("label".to_string(), json!(metric_name(&candidate.labels)));
        if let Some(item) = candidate.labels.get(ITEM) {
            body.insert("item".to_string(), json!(item));
        }
        if !refs.service.is_empty() {
            body.insert("service".to_string(), json!(refs.service));
        }
        if !refs.container.is_empty() {
            body.insert("container".to_string(), json!(refs.container));
        }
        if !refs.status_of.is_empty() {
            body.insert("status_of".to_string(), json!(refs.status_of));
        }
        body.insert("first_seen_at".to_string(), json!(first_seen));

        Value::Object(body)
    }

    fn record_failure(&mut self, labels_text: &str, kind: FailureKind) {
        let now = self.ctx.now();
        let failure = self
            .failures
            .entry(labels_text.to_string())
            .or_insert_with(|| MetricRegistration {
                labels_text: labels_text.to_string(),
                fail_counter: 0,
                last_fail_at: now,
                last_fail_kind: kind,
            });

        failure.fail_counter += 1;
        failure.last_fail_at = now;
        failure.last_fail_kind = kind;
        self.failures_changed = true;

        self.ctx.metrics.inc_registration_failure(&kind.to_string());
    }

    fn clear_failure(&mut self, labels_text: &str) {
        if self.failures.remove(labels_text).is_some() {
            self.failures_changed = true;
        }
    }

    /// PATCH a deactivated metric back to active. `None` when the API no longer knows it.
    async fn reactivate(&self, execution: &Execution, metric: &Metric) -> Result<Option<Metric>, ClientError> {
        let path = format!("v1/metric/{}/", metric.id);
        let result = execution
            .client()
            .do_json::<Metric>(Method::PATCH, &path, &[("fields", METRIC_FIELDS)], Some(json!({ "active": true })))
            .await;

        match result {
            Ok(metric) => Ok(Some(metric)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn register(&mut self, execution: &Execution, full: bool) -> Result<()> {
        let only_essential = execution.is_only_essential();

        let mut pending = prioritize_and_filter(
            self.ctx.config.metric_format,
            self.pending_registrations(full),
            only_essential,
            |c| &c.labels,
        );

        let budget = self.ctx.config.metric_registration_budget;
        if pending.len() > budget {
            debug!(pending = pending.len(), budget = budget, "Too many metrics to register, continuing next pass");
            pending.truncate(budget);
            execution.request_synchronization(EntityName::Metric, false);
        }

        // Metrics referenced by a status go first
        let (plain, with_status): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|c| c.annotations.status_of.is_empty());

        let cached = self.cached_by_key();
        let mut registered: Vec<Metric> = Vec::new();
        let mut permanent_blocked = false;
        let mut missing: HashSet<EntityName> = HashSet::new();

        for candidate in plain.into_iter().chain(with_status) {
            let retries_permanent = self
                .failures
                .get(&candidate.labels_text)
                .map(|f| f.last_fail_kind.is_permanent())
                .unwrap_or(false);

            // One permanent failure is retried first, the others only if it passed
            if retries_permanent && permanent_blocked {
                continue;
            }

            // Statuses registered earlier in this pass must be visible
            if !registered.is_empty() && !candidate.annotations.status_of.is_empty() {
                self.ctx.cache.upsert_metrics(std::mem::take(&mut registered));
            }

            let refs = match self.resolve(&candidate) {
                Ok(refs) => refs,
                Err(MissingDependency(entity)) => {
                    debug!(metric = %candidate.labels_text, dependency = %entity, "Metric waits for a dependency");
                    missing.insert(entity);
                    continue;
                }
            };

            if let Some(metric) = cached.get(&candidate.key()).filter(|m| !m.is_active()) {
                match self.reactivate(execution, &metric).await {
                    Ok(Some(metric)) => {
                        debug!(metric = %metric.labels_text, id = %metric.id, "Metric reactivated");
                        self.clear_failure(&candidate.labels_text);
                        registered.push(metric);
                        continue;
                    }
                    Ok(None) => {
                        // Deleted on the API, register it again
                        self.ctx.cache.delete_metrics(&[metric.id.clone()]);
                    }
                    Err(e) => {
                        self.ctx.cache.upsert_metrics(registered);
                        return Err(anyhow::Error::from(e))
                            .with_context(|| format!("Failed to reactivate metric {}", candidate.labels_text));
                    }
                }
            }

            let body = self.payload(&candidate, &refs);
            let result = execution
                .client()
                .do_json::<Metric>(Method::POST, "v1/metric/", &[("fields", METRIC_FIELDS)], Some(body))
                .await;

            match result {
                Ok(metric) => {
                    debug!(metric = %metric.labels_text, id = %metric.id, "Metric registered");
                    self.clear_failure(&candidate.labels_text);
                    registered.push(metric);
                }
                Err(ClientError::Api(api)) if api.is_client_error() => {
                    let kind = failure_kind_from_body(&api.body);
                    debug!(
                        metric = %candidate.labels_text,
                        kind = %kind,
                        status = api.status_code,
                        "Metric registration refused"
                    );
                    self.record_failure(&candidate.labels_text, kind);
                    if retries_permanent {
                        permanent_blocked = true;
                    }
                }
                Err(e) => {
                    self.ctx.cache.upsert_metrics(registered);
                    return Err(anyhow::Error::from(e))
                        .with_context(|| format!("Failed to register metric {}", candidate.labels_text));
                }
            }
        }

        if !registered.is_empty() {
            info!(registered = registered.len(), "Metrics registered");
        }
        self.ctx.cache.upsert_metrics(registered);

        for entity in missing {
            execution.request_synchronization(entity, false);
        }

        Ok(())
    }

    async fn deactivate(&mut self, execution: &Execution) -> Result<()> {
        let to_deactivate = self.pending_deactivations();
        if to_deactivate.is_empty() {
            return Ok(());
        }

        let mut updated: Vec<Metric> = Vec::new();
        let mut removed: Vec<String> = Vec::new();

        for mut metric in to_deactivate {
            let path = format!("v1/metric/{}/", metric.id);
            let result = execution
                .client()
                .do_request(Method::PATCH, &path, &[("fields", "active")], Some(json!({ "active": false })))
                .await;

            match result {
                Ok(_) => {
                    debug!(metric = %metric.labels_text, id = %metric.id, "Metric deactivated");
                    metric.deactivated_at = Some(self.ctx.now());
                    updated.push(metric);
                }
                Err(e) if e.is_not_found() => removed.push(metric.id),
                Err(e) => {
                    self.ctx.cache.upsert_metrics(updated);
                    self.ctx.cache.delete_metrics(&removed);
                    return Err(anyhow::Error::from(e))
                        .with_context(|| format!("Failed to deactivate metric {}", metric.labels_text));
                }
            }
        }

        info!(deactivated = updated.len(), deleted = removed.len(), "Metrics no longer seen deactivated");
        self.ctx.cache.upsert_metrics(updated);
        self.ctx.cache.delete_metrics(&removed);
        Ok(())
    }

    async fn refresh_all(&self, execution: &Execution) -> Result<()> {
        let previous = self.ctx.cache.metrics_by_uuid();
        let metrics: Vec<Metric> = list_records(execution.client(), "metric", &[("fields", METRIC_FIELDS)])
            .await
            .context("Failed to list metrics")?;

        let thresholds_changed = metrics.len() != previous.len()
            || metrics.iter().any(|m| match previous.get(&m.id) {
                Some(old) => old.threshold != m.threshold || old.unit != m.unit || old.promql_query != m.promql_query,
                None => true,
            });

        if thresholds_changed {
            execution.request_update_thresholds();
        }

        self.ctx.cache.set_metrics(metrics);
        Ok(())
    }

    /// Reload active metrics only, keeping deactivated ones from the cache.
    async fn refresh_active(&self, execution: &Execution) -> Result<()> {
        let active: Vec<Metric> = list_records(
            execution.client(),
            "metric",
            &[("fields", METRIC_FIELDS), ("active", "True")],
        )
        .await
        .context("Failed to list active metrics")?;

        let active_ids: HashSet<&str> = active.iter().map(|m| m.id.as_str()).collect();
        let mut metrics: Vec<Metric> = self
            .ctx
            .cache
            .metrics()
            .into_iter()
            .filter(|m| !m.is_active() && !active_ids.contains(m.id.as_str()))
            .collect();
        metrics.extend(active);

        self.ctx.cache.set_metrics(metrics);
        Ok(())
    }
}

#[async_trait]
impl EntitySynchronizer for MetricSync {
    fn name(&self) -> EntityName {
        EntityName::Metric
    }

    async fn prepare_execution(&mut self, _execution: &Execution) -> Result<bool> {
        self.failures = self
            .ctx
            .cache
            .metric_registrations_fail()
            .into_iter()
            .map(|f| (f.labels_text.clone(), f))
            .collect();
        self.failures_changed = false;

        self.local = self.local_metrics();

        let now = self.ctx.now();
        for candidate in &self.local {
            self.first_seen.entry(candidate.key()).or_insert(now);
        }

        Ok(true)
    }

    async fn need_synchronization(&mut self, execution: &Execution) -> bool {
        if !self.pending_registrations(false).is_empty() {
            return true;
        }

        !execution.is_only_essential() && !self.pending_deactivations().is_empty()
    }

    async fn refresh_cache(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        if sync_type.is_full() {
            self.refresh_all(execution).await?;
        } else if !self.pending_registrations(false).is_empty() {
            self.refresh_active(execution).await?;
        }

        self.ctx.metrics.set_cached("metric", self.ctx.cache.metrics().len());
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        self.register(execution, sync_type.is_full()).await?;

        if !execution.is_only_essential() {
            self.deactivate(execution).await?;
        }

        self.ctx.metrics.set_cached("metric", self.ctx.cache.metrics().len());
        Ok(())
    }

    fn finish_execution(&mut self, _execution: &Execution) {
        if !self.failures_changed {
            return;
        }

        let mut failures: Vec<MetricRegistration> = self.failures.values().cloned().collect();
        failures.sort_by(|a, b| a.labels_text.cmp(&b.labels_text));

        let permanent = failures.iter().filter(|f| f.last_fail_kind.is_permanent()).count();
        if permanent > 0 {
            warn!(count = permanent, "Some metrics are refused by the Bleemeo API until the next full synchronization");
        }

        self.ctx.cache.set_metric_registrations_fail(failures);
        self.failures_changed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_from_body() {
        let cases = [
            (r#"{"label":["This metric is not whitelisted for this agent"]}"#, FailureKind::AllowList),
            (r#"{"label":["This metric is not in allow-list for this agent"]}"#, FailureKind::AllowList),
            (r#"{"label":["Too many non standard metrics"]}"#, FailureKind::TooManyMetric),
            (r#"{"label":["Too many metrics"]}"#, FailureKind::TooManyMetric),
            ("no information about whether the error is permanent or not", FailureKind::Unknown),
            (r#"{"label":["Too many requests"]}"#, FailureKind::Unknown),
            ("", FailureKind::Unknown),
        ];

        for (body, want) in cases {
            assert_eq!(failure_kind_from_body(body), want, "body {:?}", body);
        }
    }
}
