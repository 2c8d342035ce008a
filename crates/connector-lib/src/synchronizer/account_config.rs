//! Agent types, account configurations and agent configurations

use super::context::SyncContext;
use super::execution::Execution;
use super::list_records;
use super::types::{EntityName, EntitySynchronizer, SyncType};
use crate::client::api_error;
use crate::models::{AccountConfig, AgentConfig, AgentType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

const AGENT_TYPE_FIELDS: &str = "id,name,display_name";
const ACCOUNT_CONFIG_FIELDS: &str = "id,name,metrics_agent_whitelist,metrics_agent_resolution,\
metrics_monitor_resolution,live_process_resolution,live_process,docker_integration,\
snmp_integration,number_of_custom_metrics";
const AGENT_CONFIG_FIELDS: &str = "id,account_config,agent_type,metrics_allowlist,metrics_resolution";

pub(crate) struct AccountConfigSync {
    ctx: Arc<SyncContext>,
    /// Current configuration before the refresh
    previous: Option<AccountConfig>,
}

impl AccountConfigSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx, previous: None }
    }

    async fn agent_configs(&self, execution: &Execution) -> Result<Vec<AgentConfig>> {
        let listed = list_records(execution.client(), "agentconfig", &[("fields", AGENT_CONFIG_FIELDS)]).await;

        match listed {
            Ok(configs) => Ok(configs),
            Err(e) => {
                let err = anyhow::Error::from(e);
                if api_error(&err).map(|a| a.is_unsupported_endpoint()).unwrap_or(false) {
                    debug!("Bleemeo API doesn't support agent configurations");
                    return Ok(Vec::new());
                }
                Err(err.context("Failed to list agent configurations"))
            }
        }
    }
}

#[async_trait]
impl EntitySynchronizer for AccountConfigSync {
    fn name(&self) -> EntityName {
        EntityName::AccountConfig
    }

    async fn prepare_execution(&mut self, _execution: &Execution) -> Result<bool> {
        self.previous = self.ctx.cache.current_account_config();
        Ok(true)
    }

    async fn need_synchronization(&mut self, execution: &Execution) -> bool {
        if self.previous.is_none() {
            execution.request_synchronization(EntityName::AccountConfig, true);
            return true;
        }

        false
    }

    async fn refresh_cache(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        if !sync_type.is_full() {
            return Ok(());
        }

        let agent_types: Vec<AgentType> = list_records(execution.client(), "agenttype", &[("fields", AGENT_TYPE_FIELDS)])
            .await
            .context("Failed to list agent types")?;
        let account_configs: Vec<AccountConfig> =
            list_records(execution.client(), "accountconfig", &[("fields", ACCOUNT_CONFIG_FIELDS)])
                .await
                .context("Failed to list account configurations")?;
        let agent_configs = self.agent_configs(execution).await?;

        self.ctx.cache.set_agent_types(agent_types);
        self.ctx.cache.set_account_configs(account_configs);
        self.ctx.cache.set_agent_configs(agent_configs);

        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, _sync_type: SyncType) -> Result<()> {
        let Some(current) = self.ctx.cache.current_account_config() else {
            debug!(
                config_id = %self.ctx.cache.agent().current_config_id,
                "Current account configuration is not known yet"
            );
            return Ok(());
        };

        if self.previous.as_ref() == Some(&current) {
            return Ok(());
        }

        let name_changed = self
            .previous
            .as_ref()
            .map(|p| p.name != current.name)
            .unwrap_or(true);

        info!(
            config = %current.name,
            docker_integration = current.docker_integration,
            resolution_secs = current.metrics_agent_resolution,
            "Account configuration changed"
        );

        self.ctx.hooks.update_config(name_changed);
        execution.request_update_thresholds();
        self.previous = Some(current);

        Ok(())
    }
}
