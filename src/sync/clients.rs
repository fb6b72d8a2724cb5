// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Pass-scoped cache of backend clients.
//!
//! A `ClientManager` lives for exactly one aggregation pass. It hands out at
//! most one client per store and closes all of them in `close_all`.

use crate::config::Config;
use crate::error::{CourierError, Result};
use crate::kubernetes::{get_typed, ObjectStore};
use crate::providers::{ProviderContext, ProviderRegistry, SecretsClient};
use crate::types::binding::{StoreKind, StoreRef};
use crate::types::store::{ClusterStoreCondition, SecretStoreSpec, StoreStatus};
use crate::types::{ClusterSecretStore, SecretStore};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A SecretStore or ClusterSecretStore reduced to what client construction needs.
#[derive(Debug, Clone)]
pub struct ResolvedStore {
    pub reference: StoreRef,
    pub spec: SecretStoreSpec,
    pub status: Option<StoreStatus>,
    pub conditions: Vec<ClusterStoreCondition>,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl ResolvedStore {
    pub fn class(&self) -> Option<&str> {
        self.spec.controller.as_deref().filter(|c| !c.is_empty())
    }

    /// An untagged store is handled by every controller.
    pub fn belongs_to(&self, controller_class: &str) -> bool {
        !matches!(self.class(), Some(c) if c != controller_class)
    }

    pub fn is_ready(&self) -> bool {
        !self.status.as_ref().is_some_and(StoreStatus::is_not_ready)
    }

    /// Whether a binding in `namespace` may use this store.
    pub fn usable_from(&self, namespace: &str) -> Result<bool> {
        if self.conditions.is_empty() {
            return Ok(true);
        }
        for condition in &self.conditions {
            if condition.matches(namespace)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn identity(&self) -> (Option<String>, Option<String>) {
        (self.uid.clone(), self.resource_version.clone())
    }
}

/// Look up the store `reference` points at; `None` when it does not exist.
pub async fn resolve_store(
    objects: &dyn ObjectStore,
    namespace: &str,
    reference: &StoreRef,
) -> Result<Option<ResolvedStore>> {
    let resolved = match reference.kind {
        StoreKind::SecretStore => get_typed::<SecretStore>(objects, Some(namespace), &reference.name)
            .await?
            .map(|store| ResolvedStore {
                reference: reference.clone(),
                uid: store.uid(),
                resource_version: store.resource_version(),
                spec: store.spec,
                status: store.status,
                conditions: Vec::new(),
            }),
        StoreKind::ClusterSecretStore => get_typed::<ClusterSecretStore>(objects, None, &reference.name)
            .await?
            .map(|store| ResolvedStore {
                reference: reference.clone(),
                uid: store.uid(),
                resource_version: store.resource_version(),
                spec: store.spec.store,
                status: store.status,
                conditions: store.spec.conditions,
            }),
    };
    Ok(resolved)
}

/// A client together with the store it talks to.
#[derive(Clone)]
pub struct StoreClient {
    /// `<kind>/<name>` of the store
    pub store: String,
    pub provider: &'static str,
    pub client: Arc<dyn SecretsClient>,
}

struct CachedClient {
    identity: (Option<String>, Option<String>),
    client: StoreClient,
}

pub struct ClientManager {
    providers: Arc<ProviderRegistry>,
    objects: Arc<dyn ObjectStore>,
    namespace: String,
    controller_class: String,
    enable_flood_gate: bool,
    enable_cluster_stores: bool,
    clients: Mutex<HashMap<(String, String), CachedClient>>,
}

impl ClientManager {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        objects: Arc<dyn ObjectStore>,
        namespace: &str,
        config: &Config,
    ) -> Self {
        Self {
            providers,
            objects,
            namespace: namespace.to_string(),
            controller_class: config.controller_class.clone(),
            enable_flood_gate: config.enable_flood_gate,
            enable_cluster_stores: config.enable_cluster_stores,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for `source`, falling back to the binding's `default` store.
    pub async fn get(&self, default: Option<&StoreRef>, source: Option<&StoreRef>) -> Result<StoreClient> {
        let reference = source.or(default).ok_or_else(|| {
            CourierError::MissingDefaultStore("a data reference without a store".to_string())
        })?;
        if reference.kind == StoreKind::ClusterSecretStore && !self.enable_cluster_stores {
            return Err(CourierError::InvalidStore(format!(
                "{} cannot be used, cluster stores are disabled",
                reference
            )));
        }

        let store = resolve_store(self.objects.as_ref(), &self.namespace, reference)
            .await?
            .ok_or_else(|| CourierError::StoreNotFound(reference.to_string()))?;
        if !store.belongs_to(&self.controller_class) {
            return Err(CourierError::InvalidStore(format!(
                "{} is handled by controller class {}",
                reference,
                store.class().unwrap_or_default()
            )));
        }
        if !store.usable_from(&self.namespace)? {
            return Err(CourierError::InvalidStore(format!(
                "{} may not be used from namespace {}",
                reference, self.namespace
            )));
        }
        if self.enable_flood_gate && !store.is_ready() {
            return Err(CourierError::StoreNotReady(reference.to_string()));
        }

        let provider_name = store.spec.provider.name()?;
        let key = (provider_name.to_string(), reference.to_string());
        let mut clients = self.clients.lock().await;
        if let Some(cached) = clients.get(&key) {
            if cached.identity == store.identity() {
                return Ok(cached.client.clone());
            }
            debug!("Store {} changed during the pass, replacing its client", reference);
            if let Some(stale) = clients.remove(&key) {
                close_client(&stale.client).await;
            }
        }

        let provider = self.providers.get(provider_name)?;
        provider.validate(&store.spec)?;
        let client = provider
            .new_client(ProviderContext {
                store: &store.spec,
                store_kind: reference.kind.clone(),
                namespace: &self.namespace,
                objects: self.objects.clone(),
            })
            .await?;
        let client = StoreClient {
            store: reference.to_string(),
            provider: provider_name,
            client,
        };
        clients.insert(
            key,
            CachedClient {
                identity: store.identity(),
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Close every client handed out during the pass.
    pub async fn close_all(&self) {
        let drained: Vec<CachedClient> = self.clients.lock().await.drain().map(|(_, c)| c).collect();
        for cached in drained {
            close_client(&cached.client).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

async fn close_client(client: &StoreClient) {
    if let Err(e) = client.client.close().await {
        warn!("Failed to close client for {}: {}", client.store, e);
    }
}
