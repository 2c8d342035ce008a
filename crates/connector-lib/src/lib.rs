//! Connector between a monitoring agent and the Bleemeo platform
//!
//! This crate provides the core functionality for:
//! - Registration of the agent and authenticated access to the REST API
//! - Synchronization of agent, configuration, services, monitors,
//!   containers, metrics, config items and diagnostics with the API
//! - A persistent local cache of the remote entities
//! - Supervision of the MQTT transport
//! - Health checks and observability

pub mod cache;
pub mod client;
pub mod clock;
pub mod connector;
pub mod diagnostic;
pub mod discovery;
pub mod health;
pub mod labels;
pub mod models;
pub mod mqtt;
pub mod observability;
pub mod state;
pub mod store;
pub mod synchronizer;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::Cache;
pub use client::{ApiError, ClientError, ClientFactory, RawClient};
pub use clock::{Clock, SystemClock};
pub use connector::{Connector, ConnectorConfig, ConnectorOptions};
pub use health::{Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{StructuredLogger, SyncMetrics};
pub use state::State;
pub use synchronizer::{Synchronizer, SynchronizerConfig, SynchronizerHooks, SynchronizerOptions};
