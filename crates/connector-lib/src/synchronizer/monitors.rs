//! Monitors probed by this agent, with creation dates spread over the minute

use super::context::SyncContext;
use super::execution::Execution;
use super::list_records;
use super::types::{EntityName, EntitySynchronizer, ScheduledMonitor, SyncType};
use crate::models::Monitor;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::sync::Arc;
use tracing::debug;

const MONITOR_FIELDS: &str = "id,account_config,agent,created_at,monitor_url,monitor_expected_content,\
monitor_expected_response_code,monitor_unexpected_content,monitor_ca_file";

/// Probes only run during the first 45 seconds of a minute
const JITTER_WINDOW_MS: u64 = 45_000;

const DEFAULT_MONITOR_RESOLUTION_SECS: i64 = 60;

pub(crate) struct MonitorSync {
    ctx: Arc<SyncContext>,
}

impl MonitorSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    fn resolution(&self) -> std::time::Duration {
        let secs = self
            .ctx
            .cache
            .current_account_config()
            .map(|c| c.metrics_monitor_resolution)
            .filter(|r| *r > 0)
            .unwrap_or(DEFAULT_MONITOR_RESOLUTION_SECS);
        std::time::Duration::from_secs(secs as u64)
    }

    fn scheduled(&self) -> Vec<ScheduledMonitor> {
        let resolution = self.resolution();
        let agent_seed = fnv1a(&self.ctx.agent_id);

        self.ctx
            .cache
            .monitors()
            .into_iter()
            .map(|monitor| {
                let seed = agent_seed ^ fnv1a(&monitor.id);
                ScheduledMonitor {
                    scheduled_at: apply_jitter_to_monitor_creation_date(monitor.created_at, seed),
                    monitor,
                    resolution,
                }
            })
            .collect()
    }
}

#[async_trait]
impl EntitySynchronizer for MonitorSync {
    fn name(&self) -> EntityName {
        EntityName::Monitor
    }

    async fn refresh_cache(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        if !sync_type.is_full() {
            return Ok(());
        }

        let monitors: Vec<Monitor> = list_records(
            execution.client(),
            "monitor",
            &[("fields", MONITOR_FIELDS), ("active", "True")],
        )
        .await
        .context("Failed to list monitors")?;

        self.ctx.metrics.set_cached("monitor", monitors.len());
        self.ctx.cache.set_monitors(monitors);
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, _execution: &Execution, _sync_type: SyncType) -> Result<()> {
        let scheduled = self.scheduled();
        debug!(monitors = scheduled.len(), "Updating monitors");
        self.ctx.hooks.update_monitors(&scheduled);
        Ok(())
    }
}

/// 64-bit FNV-1a hash
pub(crate) fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Move a creation date inside the first 45 seconds of its own minute.
///
/// The result only depends on the seed and the minute, so every agent
/// computes the same schedule for a given monitor.
pub fn apply_jitter_to_monitor_creation_date(created_at: DateTime<Utc>, seed: u64) -> DateTime<Utc> {
    let minute = created_at
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(created_at);
    let offset_ms = splitmix64(seed ^ minute.timestamp() as u64) % JITTER_WINDOW_MS;

    minute + Duration::milliseconds(offset_ms as i64)
}
