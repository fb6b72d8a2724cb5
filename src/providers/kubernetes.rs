// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Provider reading Secrets from another namespace of the same cluster.

use super::{json_property, object_to_map, value_bytes, Provider, ProviderContext, SecretsClient};
use crate::error::{CourierError, Result};
use crate::kubernetes::{get_typed, list_typed, ObjectStore};
use crate::sync::SecretData;
use crate::types::binding::{ExtractRef, FindRef, RemoteRef};
use crate::types::store::SecretStoreSpec;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct KubernetesProvider;

#[async_trait]
impl Provider for KubernetesProvider {
    fn validate(&self, store: &SecretStoreSpec) -> Result<()> {
        match &store.provider.kubernetes {
            Some(spec) if !spec.remote_namespace.is_empty() => Ok(()),
            Some(_) => Err(CourierError::InvalidStore("remoteNamespace must be set".to_string())),
            None => Err(CourierError::InvalidStore("missing kubernetes provider block".to_string())),
        }
    }

    async fn new_client(&self, ctx: ProviderContext<'_>) -> Result<Arc<dyn SecretsClient>> {
        self.validate(ctx.store)?;
        let remote_namespace = ctx
            .store
            .provider
            .kubernetes
            .as_ref()
            .map(|k| k.remote_namespace.clone())
            .unwrap_or_default();
        debug!(
            "Reading secrets from namespace {} for {}",
            remote_namespace, ctx.namespace
        );
        Ok(Arc::new(KubernetesClient {
            objects: ctx.objects,
            remote_namespace,
        }))
    }
}

pub struct KubernetesClient {
    objects: Arc<dyn ObjectStore>,
    remote_namespace: String,
}

impl KubernetesClient {
    async fn secret_data(&self, name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let secret: Secret = get_typed(self.objects.as_ref(), Some(&self.remote_namespace), name)
            .await?
            .ok_or_else(|| CourierError::NoSecret(format!("{}/{}", self.remote_namespace, name)))?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}

/// A whole Secret rendered as a JSON object of string values.
fn data_as_json(data: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let doc: serde_json::Map<String, serde_json::Value> = data
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(String::from_utf8_lossy(v).into_owned())))
        .collect();
    serde_json::Value::Object(doc).to_string().into_bytes()
}

#[async_trait]
impl SecretsClient for KubernetesClient {
    async fn get_secret(&self, remote: &RemoteRef) -> Result<Vec<u8>> {
        let data = self.secret_data(&remote.key).await?;
        match &remote.property {
            None => Ok(data_as_json(&data)),
            Some(property) => {
                if let Some(value) = data.get(property) {
                    return Ok(value.clone());
                }
                // dotted paths into a JSON encoded value, e.g. `config.db.user`
                let (key, rest) = property.split_once('.').ok_or_else(|| {
                    CourierError::BackendError(format!("property {} not found in {}", property, remote.key))
                })?;
                let raw = data.get(key).ok_or_else(|| {
                    CourierError::BackendError(format!("property {} not found in {}", property, remote.key))
                })?;
                let doc: serde_json::Value = serde_json::from_slice(raw)?;
                json_property(&doc, rest)
                    .map(value_bytes)
                    .ok_or_else(|| CourierError::BackendError(format!("property {} not found in {}", property, remote.key)))
            }
        }
    }

    async fn get_secret_map(&self, extract: &ExtractRef) -> Result<SecretData> {
        let data = self.secret_data(&extract.key).await?;
        match &extract.property {
            None => Ok(data),
            Some(property) => {
                let raw = data.get(property).ok_or_else(|| {
                    CourierError::BackendError(format!("property {} not found in {}", property, extract.key))
                })?;
                let doc: serde_json::Value = serde_json::from_slice(raw)?;
                object_to_map(&doc, property)
            }
        }
    }

    async fn get_all_secrets(&self, find: &FindRef) -> Result<SecretData> {
        let selector = (!find.tags.is_empty()).then(|| {
            find.tags
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        });
        let name = find.name.as_ref().map(|n| Regex::new(&n.regexp)).transpose()?;

        let secrets: Vec<Secret> =
            list_typed(self.objects.as_ref(), Some(&self.remote_namespace), selector.as_deref()).await?;

        let mut out = SecretData::new();
        for secret in secrets {
            let secret_name = secret.name_any();
            if let Some(re) = &name {
                if !re.is_match(&secret_name) {
                    continue;
                }
            }
            let data: BTreeMap<String, Vec<u8>> = secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect();
            out.insert(secret_name, data_as_json(&data));
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
