// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::error::{CourierError, Result};
use crate::types::condition::{ready_status, Condition};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(
    group = "courier.geeko.me",
    version = "v1",
    kind = "SecretStore",
    namespaced,
    status = "StoreStatus",
    shortname = "ss"
)]
#[serde(rename_all = "camelCase")]
pub struct SecretStoreSpec {
    /// Controller class this store is served by, any class when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    pub provider: ProviderSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(
    group = "courier.geeko.me",
    version = "v1",
    kind = "ClusterSecretStore",
    status = "StoreStatus",
    shortname = "css"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecretStoreSpec {
    #[serde(flatten)]
    pub store: SecretStoreSpec,
    /// Namespaces allowed to use this store, every namespace when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterStoreCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStoreCondition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_regexes: Vec<String>,
}

impl ClusterStoreCondition {
    pub fn matches(&self, namespace: &str) -> Result<bool> {
        if self.namespaces.iter().any(|ns| ns == namespace) {
            return Ok(true);
        }
        for pattern in &self.namespace_regexes {
            if regex::Regex::new(pattern)
                .map_err(|e| CourierError::InvalidStore(format!("bad namespace regex {}: {}", pattern, e)))?
                .is_match(namespace)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Exactly one provider block must be set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake: Option<FakeProviderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesProviderSpec>,
}

impl ProviderSpec {
    /// Name of the configured provider block, used as the registry key.
    pub fn name(&self) -> Result<&'static str> {
        let mut names = Vec::new();
        if self.fake.is_some() {
            names.push("fake");
        }
        if self.kubernetes.is_some() {
            names.push("kubernetes");
        }
        match names.as_slice() {
            [name] => Ok(*name),
            [] => Err(CourierError::InvalidStore("no provider configured".to_string())),
            _ => Err(CourierError::InvalidStore(format!(
                "more than one provider configured: {}",
                names.join(", ")
            ))),
        }
    }
}

/// Static key/value pairs served from the store spec itself.
#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FakeProviderSpec {
    #[serde(default)]
    pub data: Vec<FakeEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FakeEntry {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Secrets of another namespace of the same cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesProviderSpec {
    pub remote_namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl StoreStatus {
    /// A store without a Ready condition is treated as usable.
    pub fn is_not_ready(&self) -> bool {
        ready_status(&self.conditions) == Some(false)
    }
}
