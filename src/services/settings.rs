//! Operator settings lookup.
//!
//! Settings are resolved from the operator-settings ConfigMap first, then from
//! the process environment, then from the caller's default.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use std::{collections::BTreeMap, env};
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Default name of the operator-settings ConfigMap.
pub const OPERATOR_SETTINGS_CONFIG_MAP: &str = "rook-ceph-operator-config";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read operator settings `{config_map}`: {source}")]
    Kube {
        config_map: String,
        source: kube::Error,
    },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Value of `key`, or `default` when no source defines it.
    async fn get_setting(&self, key: &str, default: &str) -> Result<String, SettingsError>;
}

/// Settings read from a ConfigMap in the operator namespace.
#[derive(Clone)]
pub struct ConfigMapSettings {
    client: Client,
    namespace: String,
    config_map: String,
}

impl ConfigMapSettings {
    pub fn new(client: Client, namespace: impl Into<String>, config_map: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            config_map: config_map.into(),
        }
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[async_trait]
impl SettingsSource for ConfigMapSettings {
    async fn get_setting(&self, key: &str, default: &str) -> Result<String, SettingsError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get_opt(&self.config_map).await {
            Ok(Some(cm)) => {
                if let Some(value) = cm.data.and_then(|mut data| data.remove(key)) {
                    debug!(key, config_map = %self.config_map, "setting read from config map");
                    return Ok(value);
                }
                Ok(env_or_default(key, default))
            }
            Ok(None) => {
                debug!(config_map = %self.config_map, "operator settings config map not found");
                Ok(env_or_default(key, default))
            }
            Err(source) => Err(SettingsError::Kube {
                config_map: self.config_map.clone(),
                source,
            }),
        }
    }
}

/// Settings from a fixed map, falling back to the environment like the
/// ConfigMap source does.
#[derive(Clone, Debug, Default)]
pub struct MapSettings {
    values: BTreeMap<String, String>,
}

impl MapSettings {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl SettingsSource for MapSettings {
    async fn get_setting(&self, key: &str, default: &str) -> Result<String, SettingsError> {
        Ok(self
            .values
            .get(key)
            .cloned()
            .unwrap_or_else(|| env_or_default(key, default)))
    }
}
