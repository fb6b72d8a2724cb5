// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Read caches for target Secrets.
//!
//! Two reflectors feed the reconciler: a metadata-only one over every Secret and
//! a full one restricted to Secrets carrying the managed label. They are updated
//! independently, so a reader has to confirm both describe the same object
//! version before trusting the full copy.

use crate::constants::labels;
use crate::error::{CourierError, Result};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{ObjectMeta, PartialObjectMeta},
    runtime::{
        metadata_watcher,
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Client,
};

pub trait TargetCache: Send + Sync {
    /// Metadata of any Secret, managed or not
    fn metadata(&self, namespace: &str, name: &str) -> Option<ObjectMeta>;
    /// Full copy of a managed Secret
    fn full(&self, namespace: &str, name: &str) -> Option<Secret>;
}

/// Fails with `CacheDesync` unless the full copy has the same identity and
/// version as the metadata cache.
pub fn ensure_caches_in_sync(meta: &ObjectMeta, full: Option<&Secret>) -> Result<()> {
    let id = format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    );
    let Some(full) = full else {
        return Err(CourierError::CacheDesync(format!("{} missing from managed cache", id)));
    };
    if full.metadata.uid != meta.uid {
        return Err(CourierError::CacheDesync(format!("{} uid differs between caches", id)));
    }
    if full.metadata.resource_version != meta.resource_version {
        return Err(CourierError::CacheDesync(format!(
            "{} resourceVersion {:?} != {:?}",
            id, full.metadata.resource_version, meta.resource_version
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ReflectorTargetCache {
    metadata: Store<PartialObjectMeta<Secret>>,
    managed: Store<Secret>,
}

impl ReflectorTargetCache {
    /// Wait until both reflectors delivered their initial list.
    pub async fn wait_until_ready(&self) -> anyhow::Result<()> {
        self.metadata.wait_until_ready().await?;
        self.managed.wait_until_ready().await?;
        Ok(())
    }
}

impl TargetCache for ReflectorTargetCache {
    fn metadata(&self, namespace: &str, name: &str) -> Option<ObjectMeta> {
        self.metadata
            .get(&ObjectRef::new(name).within(namespace))
            .map(|m| m.metadata.clone())
    }

    fn full(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.managed
            .get(&ObjectRef::new(name).within(namespace))
            .map(|s| (*s).clone())
    }
}

pub type SecretEvents = std::pin::Pin<Box<dyn Stream<Item = std::result::Result<Secret, watcher::Error>> + Send>>;
pub type MetadataDriver = std::pin::Pin<Box<dyn futures::Future<Output = ()> + Send>>;

/// Build the Secret caches.
///
/// The metadata reflector is driven by the returned future. The managed
/// reflector is driven by whoever polls the returned event stream, normally
/// the binding controller which maps the events back to bindings.
pub fn secret_caches(
    client: Client,
    namespace: Option<&str>,
) -> (ReflectorTargetCache, MetadataDriver, SecretEvents) {
    let api: Api<Secret> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let (metadata, metadata_writer) = reflector::store();
    let metadata_driver = kube::runtime::reflector(
        metadata_writer,
        metadata_watcher(api.clone(), watcher::Config::default()),
    )
    .default_backoff()
    .touched_objects()
    .for_each(|res| async move {
        if let Err(e) = res {
            tracing::warn!("Secret metadata watch error: {}", e);
        }
    });

    let (managed, managed_writer) = reflector::store();
    let managed_config =
        watcher::Config::default().labels(&format!("{}={}", labels::MANAGED, labels::MANAGED_VALUE));
    let events = kube::runtime::reflector(managed_writer, watcher(api, managed_config))
        .default_backoff()
        .applied_objects();

    (
        ReflectorTargetCache { metadata, managed },
        Box::pin(metadata_driver),
        Box::pin(events),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(uid: &str, rv: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some("creds".to_string()),
            namespace: Some("apps".to_string()),
            uid: Some(uid.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        }
    }

    fn secret(uid: &str, rv: &str) -> Secret {
        Secret {
            metadata: meta(uid, rv),
            ..Default::default()
        }
    }

    #[test]
    fn test_caches_in_sync() {
        assert!(ensure_caches_in_sync(&meta("u1", "5"), Some(&secret("u1", "5"))).is_ok());
    }

    #[test]
    fn test_missing_full_copy_is_desync() {
        let err = ensure_caches_in_sync(&meta("u1", "5"), None).unwrap_err();
        assert!(matches!(err, CourierError::CacheDesync(_)));
    }

    #[test]
    fn test_version_mismatch_is_desync() {
        let err = ensure_caches_in_sync(&meta("u1", "6"), Some(&secret("u1", "5"))).unwrap_err();
        assert!(matches!(err, CourierError::CacheDesync(_)));
    }

    #[test]
    fn test_recreated_object_is_desync() {
        let err = ensure_caches_in_sync(&meta("u2", "5"), Some(&secret("u1", "5"))).unwrap_err();
        assert!(matches!(err, CourierError::CacheDesync(_)));
    }
}
