//! Main agent update and agent list

use super::context::SyncContext;
use super::execution::Execution;
use super::list_records;
use super::types::{EntityName, EntitySynchronizer, SyncError, SyncType};
use crate::client::RawClientExt;
use crate::models::{Agent, Tag};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Longest tag accepted by the API
const API_TAG_LENGTH: usize = 100;

pub(crate) const AGENT_FIELDS: &str =
    "account,agent_type,created_at,current_config,display_name,fqdn,id,is_cluster_leader,next_config_at,tags";

pub(crate) struct AgentSync {
    ctx: Arc<SyncContext>,
    warned_account_mismatch: bool,
}

impl AgentSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            warned_account_mismatch: false,
        }
    }

    fn tags(&self) -> Vec<Tag> {
        self.ctx
            .config
            .tags
            .iter()
            .filter(|t| !t.is_empty() && t.len() <= API_TAG_LENGTH)
            .map(|t| Tag {
                name: t.clone(),
                is_automatic: false,
            })
            .collect()
    }

    async fn sync_main_agent(&mut self, execution: &Execution) -> Result<()> {
        let previous = self.ctx.cache.agent();
        let path = format!("v1/agent/{}/", self.ctx.agent_id);

        let agent: Agent = execution
            .client()
            .do_json(
                Method::PATCH,
                &path,
                &[("fields", AGENT_FIELDS)],
                Some(json!({ "tags": self.tags() })),
            )
            .await
            .context("Failed to update the main agent")?;

        self.ctx.cache.set_agent(agent.clone());

        if agent.current_config_id.is_empty() {
            return Err(SyncError::NoConfig.into());
        }

        self.ctx.cache.set_account_id(agent.account.clone());

        let configured = &self.ctx.config.account_id;
        if !configured.is_empty() && *configured != agent.account && !self.warned_account_mismatch {
            self.warned_account_mismatch = true;
            warn!(
                configured_account = %configured,
                account = %agent.account,
                "Account ID in configuration mismatches the current account ID, the configured one is ignored"
            );
        }

        match (previous.is_cluster_leader, agent.is_cluster_leader) {
            (false, true) => info!("This agent is the Kubernetes cluster leader"),
            (true, false) => info!("This agent is no longer the Kubernetes cluster leader"),
            _ => {}
        }

        Ok(())
    }

    async fn update_agent_list(&self, execution: &Execution) -> Result<()> {
        let previous: HashSet<String> = self.ctx.cache.agents().into_iter().map(|a| a.id).collect();

        let agents: Vec<Agent> = list_records(execution.client(), "agent", &[("fields", AGENT_FIELDS)])
            .await
            .context("Failed to list agents")?;

        let current: HashSet<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        if previous.iter().any(|id| !current.contains(id.as_str())) {
            // Metrics labeled with a deleted agent need new labels
            execution.request_notify_labels_update();
        }

        self.ctx.metrics.set_cached("agent", agents.len());
        self.ctx.cache.set_agents(agents);

        Ok(())
    }
}

#[async_trait]
impl EntitySynchronizer for AgentSync {
    fn name(&self) -> EntityName {
        EntityName::Agent
    }

    async fn need_synchronization(&mut self, _execution: &Execution) -> bool {
        let agent = self.ctx.cache.agent();
        if agent.id.is_empty() || agent.current_config_id.is_empty() {
            return true;
        }

        agent
            .next_config_at
            .map(|at| at <= self.ctx.now())
            .unwrap_or(false)
    }

    async fn refresh_cache(&mut self, _execution: &Execution, _sync_type: SyncType) -> Result<()> {
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        self.sync_main_agent(execution).await?;

        if execution.is_only_essential() {
            return Ok(());
        }

        if sync_type.is_full() {
            self.update_agent_list(execution).await?;
        }

        Ok(())
    }
}
