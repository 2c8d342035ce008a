//! First registration of the agent with the account registration key

use super::config::SynchronizerConfig;
use crate::client::{ClientFactory, RawClient};
use crate::state::{State, KEY_AGENT_UUID, KEY_PASSWORD};
use anyhow::{bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

const PASSWORD_LENGTH: usize = 20;

/// Credentials of a registered agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCredentials {
    pub agent_id: String,
    pub password: String,
    /// Whether the agent was registered by this call
    pub newly_registered: bool,
}

#[derive(Debug, Deserialize)]
struct RegisteredAgent {
    id: String,
}

pub(crate) fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Load the credentials from the state, registering the agent when there are none.
pub async fn ensure_registered(
    config: &SynchronizerConfig,
    state: &State,
    factory: &dyn ClientFactory,
) -> Result<AgentCredentials> {
    let agent_id = state.get_string(KEY_AGENT_UUID)?;
    let password = state.get_string(KEY_PASSWORD)?;

    if let (Some(agent_id), Some(password)) = (agent_id, password) {
        debug!(agent_id = %agent_id, "Agent already registered");
        return Ok(AgentCredentials {
            agent_id,
            password,
            newly_registered: false,
        });
    }

    if config.account_id.is_empty() || config.registration_key.is_empty() {
        bail!("bleemeo.account_id and bleemeo.registration_key must be set to register the agent");
    }

    // Reuse a password saved by an interrupted registration
    let password = match state.get_string(KEY_PASSWORD)? {
        Some(password) => password,
        None => {
            let password = generate_password();
            state.set(KEY_PASSWORD, &password)?;
            password
        }
    };

    let client = factory
        .registration(&config.account_id, &config.registration_key)
        .context("Failed to build the registration client")?;

    let body = json!({
        "account": config.account_id,
        "initial_password": password,
        "display_name": config.display_name,
        "fqdn": config.fqdn,
    });

    let response = client
        .do_request(Method::POST, "v1/agent/", &[], Some(body))
        .await
        .context("Registration request failed")?;

    if response.status != 201 {
        bail!("registration failed with status {}: {}", response.status, response.body);
    }

    let registered: RegisteredAgent =
        serde_json::from_value(response.body).context("Failed to decode the registration response")?;

    state.set(KEY_AGENT_UUID, &registered.id)?;

    info!(
        agent_id = %registered.id,
        account_id = %config.account_id,
        fqdn = %config.fqdn,
        "Agent registered"
    );

    Ok(AgentCredentials {
        agent_id: registered.id,
        password,
        newly_registered: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_passwords() {
        let a = generate_password();
        let b = generate_password();

        assert_eq!(a.len(), PASSWORD_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
