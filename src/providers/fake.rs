// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Provider serving static entries from the store spec.

use super::{json_property, object_to_map, value_bytes, Provider, ProviderContext, SecretsClient};
use crate::error::{CourierError, Result};
use crate::sync::SecretData;
use crate::types::binding::{ExtractRef, FindRef, RemoteRef};
use crate::types::store::{FakeEntry, SecretStoreSpec};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;

pub struct FakeProvider;

#[async_trait]
impl Provider for FakeProvider {
    fn validate(&self, store: &SecretStoreSpec) -> Result<()> {
        let fake = store
            .provider
            .fake
            .as_ref()
            .ok_or_else(|| CourierError::InvalidStore("missing fake provider block".to_string()))?;
        if let Some(entry) = fake.data.iter().find(|e| e.key.is_empty()) {
            return Err(CourierError::InvalidStore(format!(
                "fake entry with value {:?} has an empty key",
                entry.value
            )));
        }
        Ok(())
    }

    async fn new_client(&self, ctx: ProviderContext<'_>) -> Result<Arc<dyn SecretsClient>> {
        self.validate(ctx.store)?;
        let entries = ctx
            .store
            .provider
            .fake
            .as_ref()
            .map(|f| f.data.clone())
            .unwrap_or_default();
        Ok(Arc::new(FakeClient { entries }))
    }
}

pub struct FakeClient {
    entries: Vec<FakeEntry>,
}

impl FakeClient {
    pub fn new(entries: Vec<FakeEntry>) -> Self {
        Self { entries }
    }

    fn lookup(&self, key: &str, version: Option<&str>) -> Option<&FakeEntry> {
        match version {
            Some(v) => self
                .entries
                .iter()
                .find(|e| e.key == key && e.version.as_deref() == Some(v)),
            None => self
                .entries
                .iter()
                .find(|e| e.key == key && e.version.is_none())
                .or_else(|| self.entries.iter().find(|e| e.key == key)),
        }
    }

    fn value(&self, key: &str, property: Option<&str>, version: Option<&str>) -> Result<Vec<u8>> {
        let entry = self
            .lookup(key, version)
            .ok_or_else(|| CourierError::NoSecret(key.to_string()))?;
        let Some(property) = property else {
            return Ok(entry.value.as_bytes().to_vec());
        };
        let doc: serde_json::Value = serde_json::from_str(&entry.value)
            .map_err(|e| CourierError::BackendError(format!("{} is not JSON: {}", key, e)))?;
        json_property(&doc, property)
            .map(value_bytes)
            .ok_or_else(|| CourierError::BackendError(format!("property {} not found in {}", property, key)))
    }
}

#[async_trait]
impl SecretsClient for FakeClient {
    async fn get_secret(&self, remote: &RemoteRef) -> Result<Vec<u8>> {
        self.value(&remote.key, remote.property.as_deref(), remote.version.as_deref())
    }

    async fn get_secret_map(&self, extract: &ExtractRef) -> Result<SecretData> {
        let raw = self.value(&extract.key, extract.property.as_deref(), extract.version.as_deref())?;
        let doc: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| CourierError::BackendError(format!("{} is not a JSON object: {}", extract.key, e)))?;
        object_to_map(&doc, &extract.key)
    }

    async fn get_all_secrets(&self, find: &FindRef) -> Result<SecretData> {
        if !find.tags.is_empty() {
            return Err(CourierError::BackendError(
                "fake provider does not support find by tags".to_string(),
            ));
        }
        let name = find.name.as_ref().map(|n| Regex::new(&n.regexp)).transpose()?;

        let mut out = SecretData::new();
        for entry in &self.entries {
            if out.contains_key(&entry.key) {
                continue;
            }
            if let Some(path) = &find.path {
                if !entry.key.starts_with(path.as_str()) {
                    continue;
                }
            }
            if let Some(re) = &name {
                if !re.is_match(&entry.key) {
                    continue;
                }
            }
            if let Some(found) = self.lookup(&entry.key, None) {
                out.insert(found.key.clone(), found.value.as_bytes().to_vec());
            }
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
