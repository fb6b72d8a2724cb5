// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Watches on target kinds other than Secret, started on demand.
//!
//! Every binding that targets a kind registers itself against that kind. The
//! watch runs while at least one binding is registered and is stopped when the
//! last one releases it.

use crate::constants::labels;
use crate::error::{CourierError, Result};
use crate::types::SecretBinding;
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use futures::StreamExt;
use kube::{
    api::{ApiResource, DynamicObject, GroupVersionKind},
    discovery,
    runtime::{
        reflector::{ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Starts the watch for one kind.
#[async_trait]
pub trait InformerFactory: Send + Sync {
    async fn start(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, JoinHandle<()>)>;
}

struct Informer {
    resource: ApiResource,
    handle: JoinHandle<()>,
    owners: HashSet<String>,
}

pub struct InformerManager {
    factory: Box<dyn InformerFactory>,
    informers: Mutex<HashMap<GroupVersionKind, Informer>>,
}

impl InformerManager {
    pub fn new(factory: Box<dyn InformerFactory>) -> Self {
        Self {
            factory,
            informers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `owner` against `gvk`, starting the watch if needed.
    /// Returns true when the watch was started by this call.
    ///
    /// The registry is not locked while the watch starts; when two callers
    /// race on the same kind the later watch is aborted.
    pub async fn ensure_informer(&self, gvk: &GroupVersionKind, owner: &str) -> Result<bool> {
        if let Some(informer) = self.informers.lock().await.get_mut(gvk) {
            informer.owners.insert(owner.to_string());
            return Ok(false);
        }

        let (resource, handle) = self.factory.start(gvk).await?;

        let mut informers = self.informers.lock().await;
        if let Some(informer) = informers.get_mut(gvk) {
            handle.abort();
            informer.owners.insert(owner.to_string());
            return Ok(false);
        }
        info!("Started informer for {}/{}", resource.api_version, resource.kind);
        informers.insert(
            gvk.clone(),
            Informer {
                resource,
                handle,
                owners: HashSet::from([owner.to_string()]),
            },
        );
        Ok(true)
    }

    /// Drop `owner` from `gvk`; the watch stops once nobody is left.
    pub async fn release_informer(&self, gvk: &GroupVersionKind, owner: &str) {
        let mut informers = self.informers.lock().await;
        release(&mut informers, gvk, owner);
    }

    /// Release every kind `owner` is registered against, except `keep`.
    pub async fn release_other_kinds(&self, owner: &str, keep: Option<&GroupVersionKind>) {
        let mut informers = self.informers.lock().await;
        let kinds: Vec<GroupVersionKind> = informers
            .iter()
            .filter(|(gvk, informer)| Some(*gvk) != keep && informer.owners.contains(owner))
            .map(|(gvk, _)| gvk.clone())
            .collect();
        for gvk in kinds {
            release(&mut informers, &gvk, owner);
        }
    }

    pub async fn release_all(&self, owner: &str) {
        self.release_other_kinds(owner, None).await
    }

    pub async fn resource_for(&self, gvk: &GroupVersionKind) -> Option<ApiResource> {
        self.informers
            .lock()
            .await
            .get(gvk)
            .map(|informer| informer.resource.clone())
    }

    pub async fn is_watching(&self, gvk: &GroupVersionKind) -> bool {
        self.informers.lock().await.contains_key(gvk)
    }

    pub async fn owners(&self, gvk: &GroupVersionKind) -> Vec<String> {
        let informers = self.informers.lock().await;
        let mut owners: Vec<String> = informers
            .get(gvk)
            .map(|i| i.owners.iter().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }
}

fn release(informers: &mut HashMap<GroupVersionKind, Informer>, gvk: &GroupVersionKind, owner: &str) {
    let Some(informer) = informers.get_mut(gvk) else {
        return;
    };
    informer.owners.remove(owner);
    if informer.owners.is_empty() {
        if let Some(informer) = informers.remove(gvk) {
            informer.handle.abort();
            info!("Stopped informer for {}/{}", gvk.group, gvk.kind);
        }
    }
}

/// Watches managed objects of a kind through the API server and triggers the
/// bindings targeting them.
pub struct KubeInformerFactory {
    client: Client,
    namespace: Option<String>,
    bindings: Store<SecretBinding>,
    trigger: UnboundedSender<ObjectRef<SecretBinding>>,
}

impl KubeInformerFactory {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        bindings: Store<SecretBinding>,
        trigger: UnboundedSender<ObjectRef<SecretBinding>>,
    ) -> Self {
        Self {
            client,
            namespace,
            bindings,
            trigger,
        }
    }
}

#[async_trait]
impl InformerFactory for KubeInformerFactory {
    async fn start(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, JoinHandle<()>)> {
        let (resource, _caps) = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| CourierError::InformerError(format!("{}/{}: {}", gvk.group, gvk.kind, e)))?;

        let api: Api<DynamicObject> = match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        let config = watcher::Config::default()
            .labels(&format!("{}={}", labels::MANAGED, labels::MANAGED_VALUE));
        let bindings = self.bindings.clone();
        let trigger = self.trigger.clone();
        let kind = resource.kind.clone();
        let api_version = resource.api_version.clone();

        let handle = tokio::spawn(async move {
            watcher(api, config)
                .default_backoff()
                .applied_objects()
                .for_each(|res| {
                    match res {
                        Ok(obj) => {
                            for binding in bindings_targeting(&bindings, &api_version, &kind, &obj) {
                                debug!("{} {} changed, triggering {:?}", kind, obj.name_any(), binding);
                                let _ = trigger.unbounded_send(binding);
                            }
                        }
                        Err(e) => warn!("Watch error for {}: {}", kind, e),
                    }
                    futures::future::ready(())
                })
                .await
        });

        Ok((resource, handle))
    }
}

fn bindings_targeting(
    bindings: &Store<SecretBinding>,
    api_version: &str,
    kind: &str,
    obj: &DynamicObject,
) -> Vec<ObjectRef<SecretBinding>> {
    let namespace = obj.namespace();
    let name = obj.name_any();
    bindings
        .state()
        .iter()
        .filter(|b| b.namespace() == namespace && b.target_name() == name)
        .filter(|b| {
            b.spec
                .target
                .manifest
                .as_ref()
                .is_some_and(|m| m.api_version == api_version && m.kind == kind)
        })
        .map(|b| ObjectRef::from_obj(b.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct CountingFactory {
        started: Arc<AtomicUsize>,
        fail: bool,
        /// Starts of `gated` kinds wait for a permit
        gated: Option<(String, Arc<Semaphore>)>,
        waiting: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InformerFactory for CountingFactory {
        async fn start(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, JoinHandle<()>)> {
            if let Some((kind, gate)) = &self.gated {
                if *kind == gvk.kind {
                    self.waiting.fetch_add(1, Ordering::SeqCst);
                    gate.acquire().await.unwrap().forget();
                }
            }
            if self.fail {
                return Err(CourierError::InformerError(format!("unknown kind {}", gvk.kind)));
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            let handle = tokio::spawn(futures::future::pending::<()>());
            Ok((ApiResource::from_gvk(gvk), handle))
        }
    }

    fn config_map_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    fn manager() -> (InformerManager, Arc<AtomicUsize>) {
        let factory = CountingFactory::default();
        let started = factory.started.clone();
        (InformerManager::new(Box::new(factory)), started)
    }

    #[tokio::test]
    async fn test_ensure_starts_once() {
        let (manager, started) = manager();
        let gvk = config_map_gvk();

        assert!(manager.ensure_informer(&gvk, "apps/a").await.unwrap());
        assert!(!manager.ensure_informer(&gvk, "apps/b").await.unwrap());
        assert!(!manager.ensure_informer(&gvk, "apps/a").await.unwrap());

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(manager.owners(&gvk).await, vec!["apps/a", "apps/b"]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_per_owner() {
        let (manager, _) = manager();
        let gvk = config_map_gvk();
        manager.ensure_informer(&gvk, "apps/a").await.unwrap();
        manager.ensure_informer(&gvk, "apps/b").await.unwrap();

        manager.release_informer(&gvk, "apps/a").await;
        manager.release_informer(&gvk, "apps/a").await;
        assert!(manager.is_watching(&gvk).await);

        manager.release_informer(&gvk, "apps/b").await;
        assert!(!manager.is_watching(&gvk).await);
    }

    #[tokio::test]
    async fn test_restart_after_last_release() {
        let (manager, started) = manager();
        let gvk = config_map_gvk();
        manager.ensure_informer(&gvk, "apps/a").await.unwrap();
        manager.release_all("apps/a").await;

        assert!(manager.ensure_informer(&gvk, "apps/a").await.unwrap());
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_other_kinds_keeps_current() {
        let (manager, _) = manager();
        let config_maps = config_map_gvk();
        let widgets = GroupVersionKind::gvk("example.com", "v1", "Widget");
        manager.ensure_informer(&config_maps, "apps/a").await.unwrap();
        manager.ensure_informer(&widgets, "apps/a").await.unwrap();

        manager.release_other_kinds("apps/a", Some(&widgets)).await;

        assert!(!manager.is_watching(&config_maps).await);
        assert!(manager.is_watching(&widgets).await);
        assert_eq!(
            manager.resource_for(&widgets).await.unwrap().plural,
            "widgets"
        );
    }

    fn gated_manager(kind: &str) -> (Arc<InformerManager>, Arc<Semaphore>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let gate = Arc::new(Semaphore::new(0));
        let factory = CountingFactory {
            gated: Some((kind.to_string(), gate.clone())),
            ..Default::default()
        };
        let started = factory.started.clone();
        let waiting = factory.waiting.clone();
        (Arc::new(InformerManager::new(Box::new(factory))), gate, started, waiting)
    }

    async fn wait_for(counter: &AtomicUsize, n: usize) {
        while counter.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_slow_start_does_not_block_other_kinds() {
        let (manager, gate, _, waiting) = gated_manager("ConfigMap");
        let config_maps = config_map_gvk();
        let widgets = GroupVersionKind::gvk("example.com", "v1", "Widget");

        let slow = tokio::spawn({
            let manager = manager.clone();
            let gvk = config_maps.clone();
            async move { manager.ensure_informer(&gvk, "apps/a").await }
        });
        wait_for(&waiting, 1).await;

        let started = tokio::time::timeout(Duration::from_secs(1), async {
            manager.ensure_informer(&widgets, "apps/b").await.unwrap();
            manager.is_watching(&widgets).await
        })
        .await
        .expect("registry locked while a watch starts");
        assert!(started);
        assert!(!manager.is_watching(&config_maps).await);

        gate.add_permits(1);
        assert!(slow.await.unwrap().unwrap());
        assert!(manager.is_watching(&config_maps).await);
    }

    #[tokio::test]
    async fn test_racing_starts_keep_one_watch_and_all_owners() {
        let (manager, gate, started, waiting) = gated_manager("ConfigMap");
        let gvk = config_map_gvk();

        let tasks: Vec<_> = ["apps/a", "apps/b"]
            .into_iter()
            .map(|owner| {
                let manager = manager.clone();
                let gvk = gvk.clone();
                tokio::spawn(async move { manager.ensure_informer(&gvk, owner).await })
            })
            .collect();
        wait_for(&waiting, 2).await;
        gate.add_permits(2);

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(manager.owners(&gvk).await, vec!["apps/a", "apps/b"]);
    }

    #[tokio::test]
    async fn test_start_error_propagates() {
        let manager = InformerManager::new(Box::new(CountingFactory {
            fail: true,
            ..Default::default()
        }));
        let gvk = config_map_gvk();

        assert!(manager.ensure_informer(&gvk, "apps/a").await.is_err());
        assert!(!manager.is_watching(&gvk).await);
    }
}
