//! Monitoring Agent - keeps a host registered and synchronized with Bleemeo
//!
//! The agent registers itself on the Bleemeo API, then keeps its services,
//! containers, metrics and configuration synchronized until it receives a
//! termination signal.

use anyhow::{Context, Result};
use connector_lib::{
    client::HttpClientFactory,
    diagnostic::CrashReportDirectory,
    discovery::StaticDiscovery,
    store::MemoryStore,
    Cache, Connector, ConnectorOptions, HealthRegistry, State, StructuredLogger, SystemClock,
};
use monitoring_agent::{api, config::AgentConfig, hooks::AgentHooks, AGENT_VERSION};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting monitoring-agent");

    let loaded = AgentConfig::load()?;
    let config = loaded.config;
    info!(fqdn = %config.fqdn, items = loaded.items.len(), "Agent configured");

    let logger = StructuredLogger::new(&config.fqdn);
    logger.log_startup(AGENT_VERSION);

    let mut connector_config = config.connector_config(loaded.items)?;
    if connector_config.mqtt_enabled {
        warn!("No MQTT transport is available, points are kept local");
        connector_config.mqtt_enabled = false;
    }

    let state = Arc::new(
        State::load_or_default(&config.state_file)
            .with_context(|| format!("Failed to load state from {}", config.state_file))?,
    );
    let cache = Arc::new(Cache::load(&state));
    let health_registry = HealthRegistry::new();

    let connector = Arc::new(Connector::new(ConnectorOptions {
        config: connector_config,
        cache,
        state,
        client_factory: Arc::new(HttpClientFactory::new(config.client_config())),
        mqtt_factory: None,
        discovery: Arc::new(StaticDiscovery::new(config.services.clone())),
        container_runtime: None,
        store: Arc::new(MemoryStore::new()),
        diagnostics: Some(Arc::new(CrashReportDirectory::new(&config.crash_report_dir))),
        hooks: Arc::new(AgentHooks::new()),
        health: Arc::new(health_registry.clone()),
        clock: Arc::new(SystemClock),
    }));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry, Some(connector.clone())));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown, _) = broadcast::channel(4);
    let mut connector_task = {
        let connector = connector.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { connector.run(shutdown).await })
    };

    let result = tokio::select! {
        joined = &mut connector_task => joined.context("connector task panicked")?,
        signal = shutdown_signal() => {
            signal?;
            logger.log_shutdown("termination signal received");
            let _ = shutdown.send(());
            connector_task.await.context("connector task panicked")?
        }
    };

    api_handle.abort();
    info!("Shutting down");

    result
}

/// Wait for SIGINT, or SIGTERM on unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => interrupted?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
