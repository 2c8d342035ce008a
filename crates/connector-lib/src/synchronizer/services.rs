//! Services discovered on the host

use super::context::SyncContext;
use super::execution::Execution;
use super::list_records;
use super::types::{EntityName, EntitySynchronizer, SyncType};
use crate::client::{is_not_found, RawClientExt};
use crate::discovery::LocalService;
use crate::models::Service;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SERVICE_FIELDS: &str = "id,account_config,agent,label,instance,listen_addresses,exe_path,stack,active,created_at";

/// Longest instance accepted by the API
const API_SERVICE_INSTANCE_LENGTH: usize = 250;

const DISCOVERY_MAX_AGE: Duration = Duration::from_secs(3600);

type ServiceKey = (String, String);

#[derive(Debug, Default)]
struct Plan {
    create: Vec<LocalService>,
    update: Vec<(String, LocalService)>,
    delete: Vec<Service>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

pub(crate) struct ServiceSync {
    ctx: Arc<SyncContext>,
    local: Vec<LocalService>,
}

impl ServiceSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            local: Vec::new(),
        }
    }

    fn plan(&self) -> Plan {
        let mut remote: HashMap<ServiceKey, Service> = self
            .ctx
            .cache
            .services()
            .into_iter()
            .filter(|s| s.agent_id == self.ctx.agent_id)
            .map(|s| ((s.label.clone(), s.instance.clone()), s))
            .collect();

        let mut plan = Plan::default();

        for service in &self.local {
            if service.instance.len() > API_SERVICE_INSTANCE_LENGTH {
                debug!(
                    service = %service.name,
                    instance = %service.instance,
                    "Service instance too long, not registering"
                );
                continue;
            }

            match remote.remove(&(service.name.clone(), service.instance.clone())) {
                None => plan.create.push(service.clone()),
                Some(existing) if differs(&existing, service) => {
                    plan.update.push((existing.id, service.clone()));
                }
                Some(_) => {}
            }
        }

        plan.delete = remote.into_values().collect();
        plan.delete.sort_by(|a, b| a.id.cmp(&b.id));
        plan
    }

    fn payload(&self, service: &LocalService) -> Value {
        json!({
            "account_config": self.ctx.cache.agent().current_config_id,
            "agent": self.ctx.agent_id,
            "label": service.name,
            "instance": service.instance,
            "listen_addresses": service.listen_addresses.join(","),
            "exe_path": service.exe_path,
            "stack": service.stack,
            "active": service.active,
        })
    }
}

fn differs(remote: &Service, local: &LocalService) -> bool {
    remote.listen_addresses != local.listen_addresses.join(",")
        || remote.exe_path != local.exe_path
        || remote.stack != local.stack
        || remote.active != local.active
}

#[async_trait]
impl EntitySynchronizer for ServiceSync {
    fn name(&self) -> EntityName {
        EntityName::Service
    }

    async fn prepare_execution(&mut self, _execution: &Execution) -> Result<bool> {
        self.local = self
            .ctx
            .discovery
            .discovery(DISCOVERY_MAX_AGE)
            .await
            .context("Service discovery failed")?;
        Ok(true)
    }

    async fn need_synchronization(&mut self, _execution: &Execution) -> bool {
        !self.plan().is_empty()
    }

    async fn refresh_cache(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        if !sync_type.is_full() {
            return Ok(());
        }

        let services: Vec<Service> = list_records(
            execution.client(),
            "service",
            &[("fields", SERVICE_FIELDS), ("agent", &self.ctx.agent_id)],
        )
        .await
        .context("Failed to list services")?;

        self.ctx.metrics.set_cached("service", services.len());
        self.ctx.cache.set_services(services);
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, _sync_type: SyncType) -> Result<()> {
        let plan = self.plan();
        if plan.is_empty() {
            return Ok(());
        }

        let mut services: HashMap<String, Service> = self.ctx.cache.services_by_uuid();
        let client = execution.client();

        // Cache is updated after each call so a later failure keeps earlier changes
        for local in &plan.create {
            let service: Service = client
                .do_json(Method::POST, "v1/service/", &[("fields", SERVICE_FIELDS)], Some(self.payload(local)))
                .await
                .with_context(|| format!("Failed to register service {}", local.name))?;

            info!(service = %service.label, instance = %service.instance, "Service registered");
            services.insert(service.id.clone(), service);
            self.ctx.cache.set_services(services.values().cloned().collect());
        }

        for (id, local) in &plan.update {
            let path = format!("v1/service/{}/", id);
            let service: Service = client
                .do_json(Method::PUT, &path, &[("fields", SERVICE_FIELDS)], Some(self.payload(local)))
                .await
                .with_context(|| format!("Failed to update service {}", local.name))?;

            debug!(service = %service.label, instance = %service.instance, "Service updated");
            services.insert(service.id.clone(), service);
            self.ctx.cache.set_services(services.values().cloned().collect());
        }

        for remote in &plan.delete {
            let path = format!("v1/service/{}/", remote.id);
            if let Err(e) = client.do_request(Method::DELETE, &path, &[], None).await {
                let err = anyhow::Error::from(e);
                if !is_not_found(&err) {
                    warn!(service = %remote.label, error = %err, "Failed to delete service");
                    return Err(err.context(format!("Failed to delete service {}", remote.label)));
                }
            }

            info!(service = %remote.label, instance = %remote.instance, "Service deleted");
            services.remove(&remote.id);
            self.ctx.cache.set_services(services.values().cloned().collect());
        }

        // Metrics may now resolve their service
        execution.request_synchronization(EntityName::Metric, false);

        Ok(())
    }
}
