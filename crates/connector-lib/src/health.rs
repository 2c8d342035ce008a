//! Health of the connector components
//!
//! The connector supervisor refreshes every component at each health check;
//! the agent serves the aggregate on its liveness and readiness endpoints.
//! - A degraded component keeps the connector operational
//! - An unhealthy component fails readiness
//! - Readiness also waits for the agent to be registered

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but retrying after errors or temporarily disabled
    Degraded,
    /// Needs an operator, e.g. rejected credentials
    Unhealthy,
}

/// Parts of the connector reporting their health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Synchronizer,
    Mqtt,
    Cache,
    ApiClient,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Synchronizer,
        Component::Mqtt,
        Component::Cache,
        Component::ApiClient,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Synchronizer => "synchronizer",
            Component::Mqtt => "mqtt",
            Component::Cache => "cache",
            Component::ApiClient => "api_client",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the component entered this status
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct Registry {
    components: BTreeMap<Component, ComponentHealth>,
    registered: bool,
}

/// Shared view of the connector health, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `component`, healthy until told otherwise.
    pub async fn register(&self, component: Component) {
        self.inner
            .write()
            .await
            .components
            .entry(component)
            .or_insert_with(|| ComponentHealth {
                status: ComponentStatus::Healthy,
                message: None,
                since: Utc::now(),
            });
    }

    pub async fn set_healthy(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded, Some(message.into())).await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.set(component, ComponentStatus::Unhealthy, Some(message.into())).await;
    }

    async fn set(&self, component: Component, status: ComponentStatus, message: Option<String>) {
        let mut registry = self.inner.write().await;

        let previous = registry.components.get(&component);
        if previous.map(|h| h.status == status && h.message == message).unwrap_or(false) {
            return;
        }

        match (previous.map(|h| h.status), status) {
            (Some(from), ComponentStatus::Healthy) if from != status => {
                info!(component = %component, "Component recovered");
            }
            (_, ComponentStatus::Healthy) => {}
            (_, _) => {
                warn!(
                    component = %component,
                    status = ?status,
                    detail = message.as_deref().unwrap_or_default(),
                    "Component health changed"
                );
            }
        }

        // A new message alone keeps the time the status was entered
        let since = previous
            .filter(|h| h.status == status)
            .map(|h| h.since)
            .unwrap_or_else(Utc::now);
        registry.components.insert(component, ComponentHealth { status, message, since });
    }

    /// Set once the agent is registered on the API.
    pub async fn set_ready(&self, registered: bool) {
        self.inner.write().await.registered = registered;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.inner.read().await.components.clone();
        let status = components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let registry = self.inner.read().await;
        if !registry.registered {
            return ReadinessResponse {
                ready: false,
                reason: Some("agent is not registered yet".to_string()),
            };
        }

        let unhealthy: Vec<&str> = registry
            .components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(component, _)| component.as_str())
            .collect();

        if unhealthy.is_empty() {
            return ReadinessResponse {
                ready: true,
                reason: None,
            };
        }

        ReadinessResponse {
            ready: false,
            reason: Some(format!("unhealthy components: {}", unhealthy.join(", "))),
        }
    }
}
