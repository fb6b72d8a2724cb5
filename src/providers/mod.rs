// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Secret backends.
//!
//! A `Provider` validates a store's provider block and builds a `SecretsClient`
//! for it. Providers are registered by the name of their block in the store
//! spec, so `provider: {fake: ...}` resolves to the provider registered as
//! `fake`.

pub mod fake;
pub mod kubernetes;

use crate::error::{CourierError, Result};
use crate::kubernetes::ObjectStore;
use crate::sync::SecretData;
use crate::types::binding::{ExtractRef, FindRef, RemoteRef, StoreKind};
use crate::types::store::SecretStoreSpec;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait SecretsClient: Send + Sync {
    /// A missing secret is `CourierError::NoSecret`
    async fn get_secret(&self, remote: &RemoteRef) -> Result<Vec<u8>>;
    async fn get_secret_map(&self, extract: &ExtractRef) -> Result<SecretData>;
    async fn get_all_secrets(&self, find: &FindRef) -> Result<SecretData>;
    async fn close(&self) -> Result<()>;
}

pub struct ProviderContext<'a> {
    pub store: &'a SecretStoreSpec,
    pub store_kind: StoreKind,
    /// Namespace of the binding the client is built for
    pub namespace: &'a str,
    pub objects: Arc<dyn ObjectStore>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn validate(&self, store: &SecretStoreSpec) -> Result<()>;
    async fn new_client(&self, ctx: ProviderContext<'_>) -> Result<Arc<dyn SecretsClient>>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers shipped with courier
    pub fn builtin() -> Self {
        Self::new()
            .with("fake", Arc::new(fake::FakeProvider))
            .with("kubernetes", Arc::new(kubernetes::KubernetesProvider))
    }

    pub fn with(mut self, name: &str, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.to_string(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| CourierError::InvalidStore(format!("unknown provider {}", name)))
    }
}

/// Look up `property` in a JSON document.
///
/// The whole property is tried as a key first so keys containing dots still
/// resolve; otherwise it is walked as a dotted path with numeric array indices.
pub fn json_property<'a>(doc: &'a Value, property: &str) -> Option<&'a Value> {
    if let Some(v) = doc.get(property) {
        return Some(v);
    }
    property.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Strings keep their raw bytes, anything else is JSON encoded.
pub fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

/// Flatten a JSON object into a secret map.
pub fn object_to_map(doc: &Value, what: &str) -> Result<SecretData> {
    let Value::Object(map) = doc else {
        return Err(CourierError::BackendError(format!("{} is not a JSON object", what)));
    };
    Ok(map.iter().map(|(k, v)| (k.clone(), value_bytes(v))).collect())
}
