//! Containers of the local runtime
//!
//! Containers are matched to the API by name, which survives a container
//! being recreated. Only a hash of the inspect payload is kept in the cache
//! so unchanged containers are not sent again.

use super::config::to_chrono;
use super::context::SyncContext;
use super::execution::Execution;
use super::list_records;
use super::types::{EntityName, EntitySynchronizer, SyncType};
use crate::client::RawClientExt;
use crate::discovery::LocalContainer;
use crate::models::{Container, ContainerPayload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use reqwest::Method;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fields kept in the cache
const CACHE_FIELDS: &str =
    "id,name,container_id,container_inspect,container_status,container_created_at,container_runtime,deleted_at";

/// Fields sent when registering
const REGISTER_FIELDS: &str = "id,name,container_id,container_inspect,container_status,container_created_at,\
container_runtime,deleted_at,host,command,container_started_at,container_finished_at,container_image_id,\
container_image_name,docker_api_version";

/// Longest container name accepted by the API
pub(crate) const API_CONTAINER_NAME_LENGTH: usize = 100;

const DOCKER_RUNTIME: &str = "docker";

/// Local containers don't need to be fresher than this
const CONTAINERS_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(120);

const THROTTLE_INTERVAL_HOURS: i64 = 1;

/// SHA-256 of an inspect payload, hex encoded
pub(crate) fn inspect_hash(inspect: &str) -> String {
    hex::encode(Sha256::digest(inspect.as_bytes()))
}

fn truncate_to_second(time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    time.map(|t| t.duration_trunc(Duration::seconds(1)).unwrap_or(t))
}

pub(crate) struct ContainerSync {
    ctx: Arc<SyncContext>,
    local: Vec<LocalContainer>,
    /// Last time a throttled message was logged
    throttled: HashMap<String, DateTime<Utc>>,
}

impl ContainerSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            local: Vec::new(),
            throttled: HashMap::new(),
        }
    }

    fn log_throttled(&mut self, message: String) {
        let now = self.ctx.now();
        let recently = self
            .throttled
            .get(&message)
            .map(|at| now - *at < Duration::hours(THROTTLE_INTERVAL_HOURS))
            .unwrap_or(false);

        if !recently {
            warn!("{}", message);
            self.throttled.insert(message, now);
        }
    }

    fn is_delayed(&self, container: &LocalContainer, now: DateTime<Utc>) -> bool {
        let delay = to_chrono(self.ctx.config.container_registration_delay);
        container
            .created_at
            .map(|created| now - created < delay)
            .unwrap_or(false)
    }

    /// Whether a local container must be sent, given its cached counterpart.
    fn needs_registration(&self, local: &LocalContainer, remote: Option<&Container>, now: DateTime<Utc>) -> bool {
        let Some(remote) = remote else {
            return true;
        };

        let unchanged = remote.status == local.state.to_string()
            && truncate_to_second(remote.created_at) == truncate_to_second(local.created_at)
            && remote.deleted_at.is_none();

        if !unchanged {
            return true;
        }

        if remote.inspect_hash == inspect_hash(&local.inspect_json) {
            return false;
        }

        let update_delay = to_chrono(self.ctx.config.container_update_delay);
        remote
            .last_updated_at
            .map(|at| now - at >= update_delay)
            .unwrap_or(true)
    }

    fn to_register(&self, now: DateTime<Utc>) -> Vec<&LocalContainer> {
        let remote = self.ctx.cache.containers_by_name();

        self.local
            .iter()
            .filter(|c| !self.is_delayed(c, now))
            .filter(|c| c.name.len() <= API_CONTAINER_NAME_LENGTH)
            .filter(|c| self.needs_registration(c, remote.get(&c.name), now))
            .collect()
    }

    /// Cached containers to delete. Among several registered containers
    /// pointing at one local container, the lowest ID is kept.
    fn to_delete(&self) -> Vec<Container> {
        let local_ids: HashSet<&str> = self.local.iter().map(|c| c.id.as_str()).collect();
        let mut kept: HashSet<String> = HashSet::new();

        let mut registered = self.ctx.cache.containers();
        registered.sort_by(|a, b| a.id.cmp(&b.id));

        registered
            .into_iter()
            .filter(|c| c.deleted_at.is_none())
            .filter(|c| !(local_ids.contains(c.container_id.as_str()) && kept.insert(c.container_id.clone())))
            .collect()
    }

    fn payload(&self, container: &LocalContainer) -> ContainerPayload {
        let docker_api_version = if container.runtime == DOCKER_RUNTIME {
            self.ctx.container_runtime.as_ref().and_then(|r| r.api_version())
        } else {
            None
        };

        ContainerPayload {
            name: container.name.clone(),
            container_id: container.id.clone(),
            container_inspect: container.inspect_json.clone(),
            container_status: container.state.to_string(),
            container_created_at: container.created_at,
            container_runtime: container.runtime.clone(),
            deleted_at: None,
            host: self.ctx.agent_id.clone(),
            command: container.command.join(" "),
            container_started_at: container.started_at,
            container_finished_at: container.finished_at,
            container_image_id: container.image_id.clone(),
            container_image_name: container.image_name.clone(),
            docker_api_version,
        }
    }

    async fn register(&mut self, execution: &Execution) -> Result<()> {
        let now = self.ctx.now();

        let too_long: Vec<String> = self
            .local
            .iter()
            .filter(|c| c.name.len() > API_CONTAINER_NAME_LENGTH)
            .map(|c| c.name.clone())
            .collect();
        for name in too_long {
            self.log_throttled(format!(
                "Container {} will be ignored because its name is too long (> {} characters)",
                name, API_CONTAINER_NAME_LENGTH
            ));
        }

        let by_name = self.ctx.cache.containers_by_name();
        let pending: Vec<(ContainerPayload, Option<String>)> = self
            .to_register(now)
            .into_iter()
            .map(|c| (self.payload(c), by_name.get(&c.name).map(|r| r.id.clone())))
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let mut containers = self.ctx.cache.containers();

        for (payload, remote_id) in pending {
            let hash = inspect_hash(&payload.container_inspect);
            let body = serde_json::to_value(&payload).context("Failed to encode container")?;

            let (method, path) = match &remote_id {
                Some(id) => (Method::PUT, format!("v1/container/{}/", id)),
                None => (Method::POST, "v1/container/".to_string()),
            };

            let result = execution
                .client()
                .do_json::<Container>(method, &path, &[("fields", REGISTER_FIELDS)], Some(body))
                .await
                .with_context(|| format!("Failed to register container {}", payload.name));

            let mut container = match result {
                Ok(container) => container,
                Err(e) => {
                    // Keep what was registered before the failure
                    self.ctx.cache.set_containers(containers);
                    return Err(e);
                }
            };

            container.inspect_hash = hash;
            container.container_inspect.clear();
            container.last_updated_at = Some(self.ctx.now());

            match remote_id {
                Some(_) => debug!(name = %container.name, id = %container.id, "Container updated"),
                None => info!(name = %container.name, id = %container.id, "Container registered"),
            }

            containers.retain(|c| c.id != container.id);
            containers.push(container);
        }

        self.ctx.metrics.set_cached("container", containers.len());
        self.ctx.cache.set_containers(containers);

        // Metrics of these containers may now be registered
        execution.request_synchronization(EntityName::Metric, false);
        Ok(())
    }

    /// Mark containers gone from the runtime as deleted. Failures are only logged.
    async fn delete_from_local(&mut self, execution: &Execution) {
        let to_delete = self.to_delete();
        if to_delete.is_empty() {
            return;
        }

        let mut containers: HashMap<String, Container> = self.ctx.cache.containers_by_uuid();
        let mut deleted: HashMap<String, DateTime<Utc>> = HashMap::new();

        for container in to_delete {
            let now = self.ctx.now();
            let path = format!("v1/container/{}/", container.id);
            let body = json!({ "deleted_at": now });

            match execution.client().do_request(Method::PATCH, &path, &[], Some(body)).await {
                Ok(_) => {
                    debug!(name = %container.name, id = %container.id, "Container deleted");
                    if let Some(cached) = containers.get_mut(&container.id) {
                        cached.deleted_at = Some(now);
                    }
                    deleted.insert(container.id.clone(), now);
                }
                Err(e) if e.is_not_found() => {
                    containers.remove(&container.id);
                    deleted.insert(container.id.clone(), now);
                }
                Err(e) => {
                    warn!(name = %container.name, error = %e, "Failed to delete container on the Bleemeo API");
                }
            }
        }

        let mut remaining: Vec<Container> = containers.into_values().collect();
        remaining.sort_by(|a, b| a.id.cmp(&b.id));
        self.ctx.cache.set_containers(remaining);

        if deleted.is_empty() {
            return;
        }

        // The API deactivates metrics of deleted containers, do the same in the cache
        let metrics = self
            .ctx
            .cache
            .metrics()
            .into_iter()
            .map(|mut metric| {
                if let Some(at) = deleted.get(&metric.container_id) {
                    if metric.deactivated_at.is_none() {
                        metric.deactivated_at = Some(*at);
                    }
                }
                metric
            })
            .collect();
        self.ctx.cache.set_metrics(metrics);

        execution.request_synchronization(EntityName::Service, true);
    }
}

#[async_trait]
impl EntitySynchronizer for ContainerSync {
    fn name(&self) -> EntityName {
        EntityName::Container
    }

    async fn prepare_execution(&mut self, _execution: &Execution) -> Result<bool> {
        self.local.clear();

        let docker_integration = self
            .ctx
            .cache
            .current_account_config()
            .map(|c| c.docker_integration)
            .unwrap_or(false);

        let Some(runtime) = self.ctx.container_runtime.as_ref().filter(|_| docker_integration) else {
            return Ok(false);
        };

        match runtime.containers(CONTAINERS_MAX_AGE, false).await {
            Ok(containers) => self.local = containers,
            Err(e) => {
                debug!(error = %e, "Unable to list containers");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn need_synchronization(&mut self, _execution: &Execution) -> bool {
        let now = self.ctx.now();
        !self.to_register(now).is_empty() || !self.to_delete().is_empty()
    }

    async fn refresh_cache(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        if !sync_type.is_full() {
            return Ok(());
        }

        let previous = self.ctx.cache.containers_by_uuid();
        let listed: Vec<Container> = list_records(
            execution.client(),
            "container",
            &[("host", &self.ctx.agent_id), ("fields", CACHE_FIELDS)],
        )
        .await
        .context("Failed to list containers")?;

        let containers: Vec<Container> = listed
            .into_iter()
            .map(|mut container| {
                container.inspect_hash = inspect_hash(&container.container_inspect);
                container.container_inspect.clear();
                container.last_updated_at = previous.get(&container.id).and_then(|c| c.last_updated_at);
                container
            })
            .collect();

        self.ctx.metrics.set_cached("container", containers.len());
        self.ctx.cache.set_containers(containers);
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, _sync_type: SyncType) -> Result<()> {
        if execution.is_only_essential() {
            return Ok(());
        }

        self.register(execution).await?;
        self.delete_from_local(execution).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_hash_is_sha256() {
        assert_eq!(
            inspect_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(inspect_hash("{\"a\":1}"), inspect_hash("{\"a\":2}"));
    }

    #[test]
    fn test_truncate_to_second() {
        let t = DateTime::parse_from_rfc3339("2024-01-01T10:00:00.750Z").unwrap().with_timezone(&Utc);
        let expected = DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(truncate_to_second(Some(t)), Some(expected));
        assert_eq!(truncate_to_second(None), None);
    }
}
