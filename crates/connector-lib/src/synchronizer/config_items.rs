//! Effective local configuration mirrored as config items

use super::context::SyncContext;
use super::execution::Execution;
use super::list_records;
use super::types::{EntityName, EntitySynchronizer, SyncType};
use crate::client::is_not_found;
use crate::models::{ConfigItemKey, ConfigItemType, RemoteConfigItem};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const CONFIG_ITEM_FIELDS: &str = "id,agent,key,value,priority,source,path,type";

/// Longest key or path accepted by the API
const MAX_FIELD_CHARS: usize = 100;

const CENSORED: &str = "*****";

/// Key fragments whose values are never sent
const SECRET_KEY_FRAGMENTS: &[&str] = &["password", "passwd", "secret", "token", "key"];

pub(crate) struct ConfigItemSync {
    ctx: Arc<SyncContext>,
}

impl ConfigItemSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    fn local_items(&self) -> BTreeMap<ConfigItemKey, Value> {
        self.ctx
            .config
            .config_items
            .iter()
            .map(|item| {
                let value = censor(&item.key, &item.value);
                let key = ConfigItemKey {
                    key: shorten(&item.key),
                    priority: item.priority,
                    source: item.source,
                    path: shorten(&item.path),
                    item_type: ConfigItemType::of(&item.value),
                };
                (key, value)
            })
            .collect()
    }

    fn remote_items(&self) -> BTreeMap<ConfigItemKey, RemoteConfigItem> {
        self.ctx
            .cache
            .config_items()
            .into_iter()
            .map(|item| {
                let key = ConfigItemKey {
                    key: item.key.clone(),
                    priority: item.priority,
                    source: item.source,
                    path: item.path.clone(),
                    item_type: item.item_type,
                };
                (key, item)
            })
            .collect()
    }
}

#[async_trait]
impl EntitySynchronizer for ConfigItemSync {
    fn name(&self) -> EntityName {
        EntityName::ConfigItem
    }

    async fn prepare_execution(&mut self, execution: &Execution) -> Result<bool> {
        Ok(!execution.is_only_essential())
    }

    async fn refresh_cache(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        if !sync_type.is_full() {
            return Ok(());
        }

        let items: Vec<RemoteConfigItem> = list_records(
            execution.client(),
            "gloutonconfigitem",
            &[("fields", CONFIG_ITEM_FIELDS), ("agent", &self.ctx.agent_id)],
        )
        .await
        .context("Failed to list config items")?;

        self.ctx.cache.set_config_items(items);
        Ok(())
    }

    async fn sync_remote_and_local(&mut self, execution: &Execution, sync_type: SyncType) -> Result<()> {
        if !sync_type.is_full() || execution.is_only_essential() {
            return Ok(());
        }

        let local = self.local_items();
        let mut remote = self.remote_items();
        let mut registered = Vec::new();

        for (key, value) in &local {
            if remote.get(key).map(|r| &r.value == value).unwrap_or(false) {
                continue;
            }

            let body = json!({
                "agent": self.ctx.agent_id,
                "key": key.key,
                "value": value,
                "priority": key.priority,
                "source": key.source,
                "path": key.path,
                "type": key.item_type,
            });

            let response = execution
                .client()
                .do_request(Method::POST, "v1/gloutonconfigitem/", &[], Some(body))
                .await
                .with_context(|| format!("Failed to register config item {}", key.key))?;

            if let Ok(item) = serde_json::from_value::<RemoteConfigItem>(response.body) {
                registered.push(item);
            }
        }

        let mut deleted = 0;
        let stale: Vec<(ConfigItemKey, String)> = remote
            .iter()
            .filter(|(key, item)| local.get(*key) != Some(&item.value))
            .map(|(key, item)| (key.clone(), item.id.clone()))
            .collect();

        for (key, id) in stale {
            let path = format!("v1/gloutonconfigitem/{}/", id);
            match execution.client().do_request(Method::DELETE, &path, &[], None).await {
                Ok(_) => {}
                Err(e) => {
                    let err = anyhow::Error::from(e);
                    if !is_not_found(&err) {
                        return Err(err.context(format!("Failed to delete config item {}", key.key)));
                    }
                }
            }
            remote.remove(&key);
            deleted += 1;
        }

        if !registered.is_empty() || deleted > 0 {
            debug!(registered = registered.len(), deleted = deleted, "Config items synchronized");
            let mut items: Vec<RemoteConfigItem> = remote.into_values().collect();
            items.extend(registered);
            self.ctx.cache.set_config_items(items);
        }

        Ok(())
    }
}

fn shorten(field: &str) -> String {
    field.chars().take(MAX_FIELD_CHARS).collect()
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_FRAGMENTS.iter().any(|fragment| key.contains(fragment))
}

/// Copy of `value` with secrets replaced, at any depth.
pub(crate) fn censor(key: &str, value: &Value) -> Value {
    if is_secret_key(key) && !value.is_null() {
        return Value::String(CENSORED.to_string());
    }

    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), censor(k, v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| censor("", v)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_censor_secrets_at_any_depth() {
        let value = json!({
            "url": "https://example.com",
            "api_token": "abc",
            "nested": {"Password": "hunter2", "user": "admin"},
            "targets": [{"secret": "s", "port": 8080}],
        });

        let censored = censor("web", &value);

        assert_eq!(
            censored,
            json!({
                "url": "https://example.com",
                "api_token": "*****",
                "nested": {"Password": "*****", "user": "admin"},
                "targets": [{"secret": "*****", "port": 8080}],
            })
        );
        // Input untouched
        assert_eq!(value["api_token"], "abc");
    }

    #[test]
    fn test_censor_top_level_key() {
        assert_eq!(censor("bleemeo.registration_key", &json!("xyz")), json!("*****"));
        assert_eq!(censor("bleemeo.account_id", &json!("xyz")), json!("xyz"));
        assert_eq!(censor("mqtt.password", &Value::Null), Value::Null);
    }

    #[test]
    fn test_shorten_is_char_based() {
        let long = "é".repeat(150);
        assert_eq!(shorten(&long).chars().count(), 100);
        assert_eq!(shorten("short"), "short");
    }
}
