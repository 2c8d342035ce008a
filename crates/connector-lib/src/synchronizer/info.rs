//! Global information published by the API: supported versions, maintenance,
//! read-only mode and server time

use super::context::SyncContext;
use super::execution::Execution;
use super::types::{EntityName, EntitySynchronizer, SyncError, SyncType};
use crate::client::RawClientExt;
use crate::models::{DisableReason, GlobalInfo};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Polling interval of the info endpoint while in maintenance without MQTT
const MAINTENANCE_POLL_INTERVAL_MINUTES: i64 = 15;

pub(crate) struct InfoSync {
    ctx: Arc<SyncContext>,
    last_fetch: Option<DateTime<Utc>>,
}

impl InfoSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            last_fetch: None,
        }
    }

    fn apply_maintenance(&self, execution: &Execution, maintenance: bool) {
        let previous = self.ctx.shared.set_maintenance(maintenance);
        if previous == maintenance {
            return;
        }

        self.ctx.hooks.set_maintenance(maintenance);

        if maintenance {
            info!("Bleemeo API is in maintenance, synchronization paused");
        } else {
            info!("Bleemeo API maintenance ended, resuming synchronization");
            execution.request_synchronization_for_all(true);
        }
    }

    fn apply_read_only(&self, read_only: bool) {
        if read_only == self.ctx.hooks.is_mqtt_read_only() {
            return;
        }

        if read_only {
            info!("MQTT read only mode enabled");
        } else {
            info!("MQTT read only mode disabled, resuming sending points");
        }

        self.ctx.hooks.set_mqtt_read_only(read_only);
    }
}

#[async_trait]
impl EntitySynchronizer for InfoSync {
    fn name(&self) -> EntityName {
        EntityName::Info
    }

    fn enabled_in_maintenance(&self) -> bool {
        true
    }

    async fn need_synchronization(&mut self, execution: &Execution) -> bool {
        let Some(last_fetch) = self.last_fetch else {
            return true;
        };

        execution.is_maintenance()
            && !self.ctx.hooks.is_mqtt_connected()
            && self.ctx.now() - last_fetch >= Duration::minutes(MAINTENANCE_POLL_INTERVAL_MINUTES)
    }

    async fn refresh_cache(&mut self, _execution: &Execution, _sync_type: SyncType) -> Result<()> {
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, _sync_type: SyncType) -> Result<()> {
        let fetched = execution
            .client()
            .do_json::<GlobalInfo>(Method::GET, "v1/info/", &[], None)
            .await;

        let mut info = match fetched {
            Ok(info) => info,
            Err(e) => {
                // Older API versions have no info endpoint
                debug!(error = %e, "Couldn't retrieve global information");
                return Ok(());
            }
        };

        let now = self.ctx.now();
        info.fetched_at = Some(now);
        self.last_fetch = Some(now);
        self.ctx.cache.set_info(info.clone());

        let minimum = &info.agents.minimum_versions.glouton_version;
        if !version_supported(&self.ctx.config.agent_version, minimum) {
            warn!(
                version = %self.ctx.config.agent_version,
                minimum_version = %minimum,
                "This agent is unsupported by the Bleemeo API, consider upgrading it"
            );
            return Err(SyncError::ShutdownRequested(DisableReason::AgentTooOld).into());
        }

        self.apply_read_only(info.read_only);
        self.apply_maintenance(execution, info.maintenance);

        if info.is_time_drift_too_large() {
            warn!(
                drift_secs = info.time_drift().map(|d| d.num_seconds()).unwrap_or_default(),
                max_drift_secs = info.max_time_drift,
                "Local time is too far from the Bleemeo API time"
            );
            return Err(SyncError::DisableFor {
                reason: DisableReason::TimeDrift,
                duration: self.ctx.config.time_drift_disable,
            }
            .into());
        }

        Ok(())
    }
}

fn version_components(version: &str) -> Option<Vec<u64>> {
    version
        .split(|c: char| c == '.' || c == '-' || c == '~')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Whether `version` is at least `minimum`. Unparsable versions are accepted.
pub(crate) fn version_supported(version: &str, minimum: &str) -> bool {
    if minimum.is_empty() {
        return true;
    }

    match (version_components(version), version_components(minimum)) {
        (Some(current), Some(required)) => {
            let len = current.len().max(required.len());
            let pad = |v: &[u64]| {
                let mut padded = v.to_vec();
                padded.resize(len, 0);
                padded
            };
            pad(&current) >= pad(&required)
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_supported() {
        let cases = [
            ("23.04.12.100000", "", true),
            ("23.04.12.100000", "23.04.12.100000", true),
            ("23.04.12.100000", "22.1", true),
            ("23.04.12.100000", "23.5", false),
            ("0.1.0", "0.1", true),
            ("0.1", "0.1.1", false),
            ("1.0.0-rc1", "0.9", true),
            ("dev", "1.0", true),
        ];

        for (version, minimum, expected) in cases {
            assert_eq!(
                version_supported(version, minimum),
                expected,
                "{} >= {}",
                version,
                minimum
            );
        }
    }
}
