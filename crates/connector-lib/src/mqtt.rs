//! Interface of the MQTT transport
//!
//! The connector only drives its lifecycle: creation after registration,
//! restarts when no report was sent for too long, and disable/read-only
//! propagation. The protocol itself lives outside this crate.

use crate::models::DisableReason;
use crate::store::MetricPoint;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Point transport to the Bleemeo platform
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Run until shutdown is signaled.
    async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()>;

    fn connected(&self) -> bool;

    /// Last time points were acknowledged by the broker.
    fn last_report(&self) -> Option<DateTime<Utc>>;

    /// Returns false when the client is stuck.
    fn health_check(&self) -> bool;

    fn disable(&self, until: DateTime<Utc>, reason: DisableReason);

    /// Clear a disable with the given reason after `delay`.
    fn clear_disable(&self, reason: DisableReason, delay: Duration);

    fn set_read_only(&self, read_only: bool);

    fn is_read_only(&self) -> bool;

    /// Stop sending points while keeping the connection.
    fn suspend_sending(&self, suspended: bool);

    /// Points not sent yet, removed from the client.
    fn pop_points(&self) -> Vec<MetricPoint>;

    fn diagnostic_page(&self) -> String;
}

/// Options of a new MQTT client
#[derive(Debug, Clone, Default)]
pub struct MqttOptions {
    pub agent_id: String,
    pub password: String,
    /// Points recovered from the previous client
    pub initial_points: Vec<MetricPoint>,
    pub read_only: bool,
}

pub trait MqttFactory: Send + Sync {
    fn create(&self, options: MqttOptions) -> Result<Arc<dyn MqttClient>>;
}
