//! Local services and containers as observed by the agent
//!
//! The synchronizers only consume these through the `Discovery` and
//! `ContainerRuntime` traits; the agent decides where they come from.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// A service discovered on the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalService {
    /// Service type, e.g. "nginx"
    pub name: String,
    /// Distinguishes several services of the same type, usually a container name
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub listen_addresses: Vec<String>,
    #[serde(default)]
    pub exe_path: String,
    #[serde(default)]
    pub stack: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Provides the list of services running on the host
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Discovered services, refreshed when the last discovery is older than `max_age`.
    async fn discovery(&self, max_age: Duration) -> Result<Vec<LocalService>>;
}

/// Discovery returning a fixed list, typically read from the configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: Vec<LocalService>,
}

impl StaticDiscovery {
    pub fn new(services: Vec<LocalService>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discovery(&self, _max_age: Duration) -> Result<Vec<LocalService>> {
        Ok(self.services.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    #[default]
    Unknown,
    Starting,
    Running,
    Restarting,
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ContainerState::Unknown => "unknown",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Restarting => "restarting",
            ContainerState::Stopped => "stopped",
        };
        write!(f, "{}", text)
    }
}

/// A container as reported by the local runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalContainer {
    /// Runtime identifier, changes when the container is recreated
    pub id: String,
    pub name: String,
    /// Runtime name, e.g. "docker" or "containerd"
    pub runtime: String,
    pub state: ContainerState,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub image_id: String,
    pub image_name: String,
    pub command: Vec<String>,
    /// Serialized inspect payload of the runtime
    pub inspect_json: String,
    /// Ignored containers are monitored by nobody
    #[serde(default)]
    pub ignored: bool,
}

/// Container lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Started(String),
    Stopped(String),
    Deleted(String),
}

/// Access to the containers of the local runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn containers(&self, max_age: Duration, include_ignored: bool) -> Result<Vec<LocalContainer>>;

    /// API version when the runtime is Docker.
    fn api_version(&self) -> Option<String> {
        None
    }

    /// Lifecycle events, when the runtime supports them.
    fn subscribe(&self) -> Option<broadcast::Receiver<ContainerEvent>> {
        None
    }
}

/// Registry of the containers on the host, fed by the agent
pub struct ContainerRegistry {
    containers: DashMap<String, LocalContainer>,
    events: broadcast::Sender<ContainerEvent>,
    api_version: Option<String>,
}

impl ContainerRegistry {
    pub fn new(api_version: Option<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            containers: DashMap::new(),
            events,
            api_version,
        }
    }

    /// Register or update a container
    pub fn register(&self, container: LocalContainer) {
        debug!(container_id = %container.id, name = %container.name, "Registering container");
        let id = container.id.clone();
        let event = match container.state {
            ContainerState::Stopped => ContainerEvent::Stopped(id.clone()),
            _ => ContainerEvent::Started(id.clone()),
        };

        self.containers.insert(id, container);
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Remove a container
    pub fn unregister(&self, container_id: &str) -> Option<LocalContainer> {
        debug!(container_id = %container_id, "Unregistering container");
        let removed = self.containers.remove(container_id).map(|(_, v)| v);
        if removed.is_some() {
            let _ = self.events.send(ContainerEvent::Deleted(container_id.to_string()));
        }
        removed
    }

    pub fn get(&self, container_id: &str) -> Option<LocalContainer> {
        self.containers.get(container_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ContainerRuntime for ContainerRegistry {
    async fn containers(&self, _max_age: Duration, include_ignored: bool) -> Result<Vec<LocalContainer>> {
        let mut containers: Vec<LocalContainer> = self
            .containers
            .iter()
            .filter(|c| include_ignored || !c.ignored)
            .map(|c| c.value().clone())
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(containers)
    }

    fn api_version(&self) -> Option<String> {
        self.api_version.clone()
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ContainerEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: &str, name: &str, ignored: bool) -> LocalContainer {
        LocalContainer {
            id: id.to_string(),
            name: name.to_string(),
            runtime: "docker".to_string(),
            state: ContainerState::Running,
            ignored,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_registry_hides_ignored_containers() {
        let registry = ContainerRegistry::new(Some("1.43".to_string()));
        registry.register(container("a", "web", false));
        registry.register(container("b", "sidecar", true));

        let visible = registry.containers(Duration::from_secs(60), false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "web");

        let all = registry.containers(Duration::from_secs(60), true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(registry.api_version().as_deref(), Some("1.43"));
    }

    #[tokio::test]
    async fn test_registry_broadcasts_lifecycle_events() {
        let registry = ContainerRegistry::default();
        let mut events = registry.subscribe().unwrap();

        registry.register(container("a", "web", false));
        registry.unregister("a");

        assert_eq!(events.recv().await.unwrap(), ContainerEvent::Started("a".to_string()));
        assert_eq!(events.recv().await.unwrap(), ContainerEvent::Deleted("a".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_container_state_display() {
        assert_eq!(ContainerState::Restarting.to_string(), "restarting");
    }
}
