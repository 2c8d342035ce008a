//! Monitoring agent connected to the Bleemeo platform
//!
//! The binary wires the connector to its local collaborators; this library
//! part holds what the binary and its tests share:
//! - Configuration loading and config items
//! - HTTP endpoints for health, readiness, metrics and diagnostics
//! - Callbacks applying what the synchronizer learns from the API

pub mod api;
pub mod config;
pub mod hooks;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
