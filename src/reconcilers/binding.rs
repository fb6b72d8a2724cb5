// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! SecretBinding reconciler.
//!
//! One pass walks a binding from class filtering to the status write:
//! resolve its sources, load the target, decide whether a refresh is due,
//! aggregate backend data, write the target and record the outcome.

use crate::config::Config;
use crate::constants::{conditions, labels};
use crate::error::{CourierError, ErrorClass, Result};
use crate::generators::{generator_class, resolve_generator, GeneratorRegistry, GeneratorStateTx};
use crate::kubernetes::{
    ensure_caches_in_sync, get_typed, secret_caches, InformerManager, KubeInformerFactory, ObjectStore,
    TargetCache,
};
use crate::metrics::MetricsSink;
use crate::providers::ProviderRegistry;
use crate::reconcilers::status::{failure_reason, with_condition, write_status};
use crate::sync::aggregate::AggregateContext;
use crate::sync::clients::resolve_store;
use crate::sync::hash::{fingerprint, owner_hash};
use crate::sync::mutate::Desired;
use crate::sync::template::load_template_sources;
use crate::sync::{aggregate, ClientManager, MutationOutcome, Mutator, Target, TargetKind, TemplateEngine};
use crate::types::binding::{
    CreationPolicy, DeletionPolicy, RefreshPolicy, SourceStatus, StoreRef, TargetBinding, TargetManifest,
};
use crate::types::{Condition, SecretBinding};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::GroupVersionKind,
    runtime::{
        controller::{Action, Config as ControllerConfig},
        reflector::{ObjectRef, Store},
        watcher, Controller, WatchStreamExt,
    },
    Api, Client, Resource, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Everything a reconciliation pass needs.
pub struct Context {
    pub objects: Arc<dyn ObjectStore>,
    pub cache: Arc<dyn TargetCache>,
    pub providers: Arc<ProviderRegistry>,
    pub generators: Arc<GeneratorRegistry>,
    pub informers: Arc<InformerManager>,
    pub templates: TemplateEngine,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: Config,
    /// Set once the target caches delivered their initial list
    pub caches_ready: Arc<AtomicBool>,
}

pub async fn reconcile(binding: Arc<SecretBinding>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = sync(&binding, &ctx).await;
    ctx.metrics.observe_reconcile(started.elapsed().as_secs_f64());
    result
}

pub fn error_policy(binding: Arc<SecretBinding>, error: &CourierError, ctx: Arc<Context>) -> Action {
    error!("Reconciling {} failed: {}", binding.key(), error);
    Action::requeue(ctx.config.error_requeue)
}

/// Reconcile the binding `namespace/name`, cleaning up after it when it no longer exists.
pub async fn reconcile_ref(ctx: Arc<Context>, namespace: &str, name: &str) -> Result<Action> {
    match get_typed::<SecretBinding>(ctx.objects.as_ref(), Some(namespace), name).await? {
        Some(binding) => reconcile(Arc::new(binding), ctx).await,
        None => {
            on_binding_deleted(&ctx, &format!("{}/{}", namespace, name)).await;
            Ok(Action::await_change())
        }
    }
}

pub async fn on_binding_deleted(ctx: &Context, key: &str) {
    info!("Binding {} deleted", key);
    ctx.metrics.binding_deleted(key);
    ctx.informers.release_all(key).await;
}

#[instrument(skip_all, fields(binding = %binding.key()))]
async fn sync(binding: &SecretBinding, ctx: &Context) -> Result<Action> {
    if binding.meta().deletion_timestamp.is_some() {
        debug!("Binding is being deleted");
        return Ok(Action::await_change());
    }
    if !ctx.caches_ready.load(Ordering::Acquire) {
        return Err(CourierError::CacheDesync("target caches are still syncing".to_string()));
    }

    let interval = match binding.refresh_interval() {
        Ok(interval) => interval,
        Err(e) => return handle_failure(ctx, binding, e, Duration::ZERO).await,
    };

    let facts = resolve_sources(binding, ctx).await?;
    if !facts.foreign.is_empty() {
        debug!("Sources {:?} belong to another controller class, skipping", facts.foreign);
        return Ok(Action::await_change());
    }
    if let Err(e) = validate_binding(binding) {
        return handle_failure(ctx, binding, e, interval).await;
    }

    let kind = match target_kind(binding, ctx).await {
        Ok(kind) => kind,
        Err(e) => return handle_failure(ctx, binding, e, interval).await,
    };
    let existing = load_target(binding, ctx, &kind).await?;
    if let Some(target) = &existing {
        if !target.is_managed() && binding.spec.target.creation_policy != CreationPolicy::None {
            mark_managed(ctx, &kind, target).await?;
            return Ok(Action::requeue(Duration::ZERO));
        }
    }

    let now = Utc::now();
    if should_skip(binding, existing.as_ref(), interval, now) {
        debug!("Target is up to date");
        return Ok(next_refresh(binding, interval, now));
    }

    if let Some(store) = facts.missing_stores.first() {
        return handle_failure(ctx, binding, CourierError::StoreNotFound(store.clone()), interval).await;
    }
    if let Some(generator) = facts.missing_generators.first() {
        return handle_failure(ctx, binding, CourierError::GeneratorNotFound(generator.clone()), interval).await;
    }
    if ctx.config.enable_flood_gate {
        if let Some(store) = facts.not_ready.first() {
            return handle_failure(ctx, binding, CourierError::StoreNotReady(store.clone()), interval).await;
        }
    }

    refresh(binding, ctx, &kind, existing, interval, now).await
}

/// Fetch, render and write; commits generator state only when the target write succeeded.
async fn refresh(
    binding: &SecretBinding,
    ctx: &Context,
    kind: &TargetKind,
    existing: Option<Target>,
    interval: Duration,
    now: DateTime<Utc>,
) -> Result<Action> {
    let namespace = binding.namespace().unwrap_or_default();
    let name = binding.name_any();
    let clients = ClientManager::new(ctx.providers.clone(), ctx.objects.clone(), &namespace, &ctx.config);
    let state = GeneratorStateTx::new(
        ctx.objects.clone(),
        ctx.generators.clone(),
        &namespace,
        &name,
        &owner_hash(&namespace, &name),
        ctx.config.generator_gc_grace,
    );
    let aggregate_ctx = AggregateContext {
        binding,
        clients: &clients,
        generators: &ctx.generators,
        state: &state,
        templates: &ctx.templates,
        objects: ctx.objects.clone(),
        metrics: ctx.metrics.as_ref(),
    };

    let aggregated = match aggregate(&aggregate_ctx).await {
        Ok(aggregated) => aggregated,
        Err(CourierError::NoSecret(msg)) => {
            info!("Backend data is gone, retaining target: {}", msg);
            state.commit().await?;
            return finish(ctx, binding, conditions::REASON_SYNCED, "secret retained", None, interval).await;
        }
        Err(e) => {
            state.rollback().await;
            return handle_failure(ctx, binding, e, interval).await;
        }
    };

    let sources = match load_template_sources(
        ctx.objects.as_ref(),
        &namespace,
        binding.spec.target.template.as_ref(),
    )
    .await
    {
        Ok(sources) => sources,
        Err(e) => {
            state.rollback().await;
            return handle_failure(ctx, binding, e, interval).await;
        }
    };

    let desired = Desired {
        binding,
        kind,
        data: &aggregated.data,
        sources: &sources,
    };
    let mutator = Mutator::new(ctx.objects.as_ref(), &ctx.templates);
    let deletion_policy = binding.spec.target.deletion_policy;
    let result = if aggregated.data.is_empty() && deletion_policy == DeletionPolicy::Delete {
        mutator.delete_target(&desired, existing.as_ref()).await
    } else if aggregated.data.is_empty() && deletion_policy == DeletionPolicy::Retain {
        Ok(MutationOutcome::Skipped)
    } else {
        mutator.apply(&desired, existing).await
    };
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            state.rollback().await;
            return handle_failure(ctx, binding, e, interval).await;
        }
    };

    state.commit().await?;
    match state.collect_garbage().await {
        Ok(0) => {}
        Ok(n) => debug!("Removed {} expired generator states", n),
        Err(e) => warn!("Generator state garbage collection failed: {}", e),
    }

    if aggregated.data.is_empty() && deletion_policy != DeletionPolicy::Merge {
        let (reason, message) = match outcome {
            MutationOutcome::Deleted => (conditions::REASON_DELETED, "secret deleted"),
            _ => (conditions::REASON_SYNCED, "secret retained"),
        };
        return finish(ctx, binding, reason, message, Some(aggregated.sources), interval).await;
    }

    if outcome.wrote() {
        info!("Target {} {:?}", binding.target_name(), outcome);
    }
    let mut status = with_condition(
        binding,
        Condition::ready(true, conditions::REASON_SYNCED, "secret synced"),
        &rfc3339(now),
    );
    status.refresh_time = Some(rfc3339(now));
    status.synced_resource_version = Some(fingerprint(binding));
    status.binding = Some(TargetBinding {
        name: binding.target_name(),
    });
    status.sources = aggregated.sources;
    write_status(ctx.objects.as_ref(), binding, &status).await?;

    ctx.metrics.sync_succeeded(&binding.key());
    ctx.metrics.set_ready(&binding.key(), true);
    Ok(after_interval(binding, interval))
}

/// Ready=True without touching the refresh bookkeeping.
async fn finish(
    ctx: &Context,
    binding: &SecretBinding,
    reason: &str,
    message: &str,
    sources: Option<Vec<SourceStatus>>,
    interval: Duration,
) -> Result<Action> {
    let mut status = with_condition(binding, Condition::ready(true, reason, message), &rfc3339(Utc::now()));
    if let Some(sources) = sources {
        status.sources = sources;
    }
    write_status(ctx.objects.as_ref(), binding, &status).await?;
    ctx.metrics.set_ready(&binding.key(), true);
    Ok(after_interval(binding, interval))
}

/// Report `err` on the binding and turn it into the pass result.
async fn handle_failure(
    ctx: &Context,
    binding: &SecretBinding,
    err: CourierError,
    interval: Duration,
) -> Result<Action> {
    match &err {
        CourierError::Conflict(what) => {
            debug!("Write conflict on {}, retrying", what);
            return Ok(Action::requeue(Duration::ZERO));
        }
        CourierError::CacheDesync(_) => return Err(err),
        _ => {}
    }
    let waits_for_edit = matches!(err, CourierError::MissingDefaultStore(_));

    let reason = failure_reason(&err);
    warn!("Sync failed ({}): {}", reason, err);
    ctx.metrics.sync_failed(&binding.key(), reason);
    ctx.metrics.set_ready(&binding.key(), false);
    let status = with_condition(
        binding,
        Condition::ready(false, reason, err.to_string()),
        &rfc3339(Utc::now()),
    );
    if let Err(e) = write_status(ctx.objects.as_ref(), binding, &status).await {
        warn!("Failed to record failure on {}: {}", binding.key(), e);
    }

    match err.class() {
        _ if waits_for_edit => Ok(Action::await_change()),
        ErrorClass::Transient => Err(err),
        ErrorClass::Permanent | ErrorClass::Absent => Ok(after_interval(binding, interval)),
    }
}

#[derive(Debug, Default)]
struct SourceFacts {
    /// Sources handled by another controller class
    foreign: Vec<String>,
    missing_stores: Vec<String>,
    missing_generators: Vec<String>,
    not_ready: Vec<String>,
}

fn store_refs(binding: &SecretBinding) -> Vec<&StoreRef> {
    let mut refs: Vec<&StoreRef> = Vec::new();
    let per_entry = binding
        .spec
        .data
        .iter()
        .filter_map(|d| d.source_ref.as_ref().and_then(|s| s.store_ref.as_ref()))
        .chain(binding.spec.data_from.iter().filter_map(|d| d.store_ref()));
    for reference in binding.spec.secret_store_ref.iter().chain(per_entry) {
        if !refs.contains(&reference) {
            refs.push(reference);
        }
    }
    refs
}

/// Existence, readiness and class of every store and generator the binding references.
async fn resolve_sources(binding: &SecretBinding, ctx: &Context) -> Result<SourceFacts> {
    let namespace = binding.namespace().unwrap_or_default();
    let class = ctx.config.controller_class.as_str();
    let mut facts = SourceFacts::default();

    for reference in store_refs(binding) {
        match resolve_store(ctx.objects.as_ref(), &namespace, reference).await? {
            None => facts.missing_stores.push(reference.to_string()),
            Some(store) if !store.belongs_to(class) => facts.foreign.push(reference.to_string()),
            Some(store) if !store.is_ready() => facts.not_ready.push(reference.to_string()),
            Some(_) => {}
        }
    }

    for generator in binding.spec.data_from.iter().filter_map(|d| d.generator_ref()) {
        let id = format!("{}/{}", generator.kind, generator.name);
        match resolve_generator(ctx.objects.as_ref(), &ctx.generators, &namespace, generator).await {
            Ok((_, obj)) => {
                if generator_class(&obj).is_some_and(|c| c != class) {
                    facts.foreign.push(id);
                }
            }
            Err(CourierError::GeneratorNotFound(_)) => facts.missing_generators.push(id),
            Err(e) => return Err(e),
        }
    }
    Ok(facts)
}

/// Configuration errors that no amount of retrying fixes.
fn validate_binding(binding: &SecretBinding) -> Result<()> {
    let target = &binding.spec.target;
    if target.deletion_policy == DeletionPolicy::Delete && target.creation_policy != CreationPolicy::Owner {
        return Err(CourierError::InvalidBinding(
            "deletionPolicy Delete requires creationPolicy Owner".to_string(),
        ));
    }
    if binding.spec.secret_store_ref.is_some() {
        return Ok(());
    }
    if let Some(data) = binding.spec.data.iter().find(|d| {
        d.source_ref
            .as_ref()
            .map_or(true, |s| s.store_ref.is_none() && s.generator_ref.is_none())
    }) {
        return Err(CourierError::MissingDefaultStore(data.secret_key.clone()));
    }
    if let Some(index) = binding
        .spec
        .data_from
        .iter()
        .position(|d| d.store_ref().is_none() && d.generator_ref().is_none())
    {
        return Err(CourierError::MissingDefaultStore(format!("dataFrom[{}]", index)));
    }
    Ok(())
}

fn is_core_secret(manifest: &TargetManifest) -> bool {
    manifest.api_version == "v1" && manifest.kind == "Secret"
}

fn manifest_gvk(manifest: &TargetManifest) -> GroupVersionKind {
    match manifest.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &manifest.kind),
        None => GroupVersionKind::gvk("", &manifest.api_version, &manifest.kind),
    }
}

/// The target kind, starting the kind's informer for generic targets.
async fn target_kind(binding: &SecretBinding, ctx: &Context) -> Result<TargetKind> {
    let key = binding.key();
    let manifest = binding
        .spec
        .target
        .manifest
        .as_ref()
        .filter(|m| !is_core_secret(m));
    let Some(manifest) = manifest else {
        ctx.informers.release_all(&key).await;
        return Ok(TargetKind::Secret);
    };
    if !ctx.config.enable_generic_targets {
        return Err(CourierError::InvalidBinding(format!(
            "target kind {} {} requires generic targets to be enabled",
            manifest.api_version, manifest.kind
        )));
    }

    let gvk = manifest_gvk(manifest);
    ctx.informers.ensure_informer(&gvk, &key).await?;
    ctx.informers.release_other_kinds(&key, Some(&gvk)).await;
    let resource = ctx.informers.resource_for(&gvk).await.ok_or_else(|| {
        CourierError::InformerError(format!("no informer running for {}/{}", gvk.group, gvk.kind))
    })?;
    Ok(TargetKind::Generic(resource))
}

/// The current target. An unmanaged Secret is returned with its metadata only.
async fn load_target(binding: &SecretBinding, ctx: &Context, kind: &TargetKind) -> Result<Option<Target>> {
    let namespace = binding.namespace().unwrap_or_default();
    let name = binding.target_name();
    match kind {
        TargetKind::Secret => {
            let Some(meta) = ctx.cache.metadata(&namespace, &name) else {
                return Ok(None);
            };
            let managed = meta
                .labels
                .as_ref()
                .and_then(|l| l.get(labels::MANAGED))
                .is_some_and(|v| v == labels::MANAGED_VALUE);
            if !managed {
                return Ok(Some(Target {
                    metadata: meta,
                    ..Default::default()
                }));
            }
            let full = ctx.cache.full(&namespace, &name);
            ensure_caches_in_sync(&meta, full.as_ref())?;
            Ok(full.map(Target::from_secret))
        }
        TargetKind::Generic(resource) => ctx
            .objects
            .get(resource, Some(&namespace), &name)
            .await?
            .map(|obj| Target::from_dynamic(kind, obj))
            .transpose(),
    }
}

async fn mark_managed(ctx: &Context, kind: &TargetKind, target: &Target) -> Result<()> {
    let name = target.metadata.name.clone().unwrap_or_default();
    info!("Labelling existing target {} as managed", name);
    ctx.objects
        .merge_patch(
            &kind.resource(),
            target.metadata.namespace.as_deref(),
            &name,
            &json!({ "metadata": { "labels": { labels::MANAGED: labels::MANAGED_VALUE } } }),
        )
        .await?;
    Ok(())
}

/// Whether the target is current and no refresh is due.
///
/// A zero refresh interval never skips under the Periodic policy.
pub fn should_skip(binding: &SecretBinding, target: Option<&Target>, interval: Duration, now: DateTime<Utc>) -> bool {
    let target_ok =
        binding.spec.target.creation_policy == CreationPolicy::None || target.is_some_and(Target::is_valid);
    if !target_ok {
        return false;
    }
    let unchanged = binding.synced_fingerprint() == Some(fingerprint(binding).as_str());
    match binding.spec.refresh_policy {
        RefreshPolicy::CreatedOnce => binding.synced_fingerprint().is_some(),
        RefreshPolicy::OnChange => unchanged,
        RefreshPolicy::Periodic => {
            if interval.is_zero() || !unchanged {
                return false;
            }
            binding
                .refresh_time()
                .and_then(|refreshed| now.signed_duration_since(refreshed).to_std().ok())
                .is_some_and(|elapsed| elapsed < interval)
        }
    }
}

/// Requeue for the remainder of the current refresh interval.
fn next_refresh(binding: &SecretBinding, interval: Duration, now: DateTime<Utc>) -> Action {
    if binding.spec.refresh_policy != RefreshPolicy::Periodic || interval.is_zero() {
        return Action::await_change();
    }
    let elapsed = binding
        .refresh_time()
        .and_then(|refreshed| now.signed_duration_since(refreshed).to_std().ok())
        .unwrap_or_default();
    Action::requeue(interval.saturating_sub(elapsed))
}

fn after_interval(binding: &SecretBinding, interval: Duration) -> Action {
    if binding.spec.refresh_policy != RefreshPolicy::Periodic || interval.is_zero() {
        Action::await_change()
    } else {
        Action::requeue(interval)
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Bindings to wake up when a managed Secret changes.
fn bindings_for_secret(bindings: &Store<SecretBinding>, secret: &Secret) -> Vec<ObjectRef<SecretBinding>> {
    let Some(namespace) = secret.namespace() else {
        return Vec::new();
    };
    let name = secret.name_any();
    let api_version = SecretBinding::api_version(&());
    let mut refs: Vec<ObjectRef<SecretBinding>> = secret
        .owner_references()
        .iter()
        .filter(|o| o.kind == "SecretBinding" && o.api_version == api_version)
        .map(|o| ObjectRef::new(&o.name).within(&namespace))
        .collect();
    refs.extend(
        bindings
            .state()
            .iter()
            .filter(|b| b.namespace().as_deref() == Some(namespace.as_str()) && b.target_name() == name)
            .filter(|b| b.spec.target.manifest.as_ref().map_or(true, is_core_secret))
            .map(|b| ObjectRef::from_obj(b.as_ref())),
    );
    refs
}

async fn watch_deletions(api: Api<SecretBinding>, ctx: Arc<Context>) {
    watcher(api, WatcherConfig::default())
        .default_backoff()
        .for_each(|event| {
            let ctx = ctx.clone();
            async move {
                match event {
                    Ok(watcher::Event::Delete(binding)) => on_binding_deleted(&ctx, &binding.key()).await,
                    Ok(_) => {}
                    Err(e) => warn!("Binding watch error: {}", e),
                }
            }
        })
        .await
}

pub struct BindingReconciler {
    client: Client,
    config: Config,
    metrics: Arc<dyn MetricsSink>,
    ready: Arc<AtomicBool>,
}

impl BindingReconciler {
    pub fn new(client: Client, config: Config, metrics: Arc<dyn MetricsSink>, ready: Arc<AtomicBool>) -> Self {
        Self {
            client,
            config,
            metrics,
            ready,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let namespace = self.config.watch_namespace.clone();
        let bindings: Api<SecretBinding> = match &namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let (cache, metadata_driver, secret_events) = secret_caches(self.client.clone(), namespace.as_deref());
        let (trigger, triggers) = futures::channel::mpsc::unbounded();
        let controller = Controller::new(bindings.clone(), WatcherConfig::default());
        let binding_store = controller.store();
        let informers = InformerManager::new(Box::new(KubeInformerFactory::new(
            self.client.clone(),
            namespace,
            binding_store.clone(),
            trigger,
        )));

        let caches_ready = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(Context {
            objects: Arc::new(crate::kubernetes::KubeObjectStore::new(self.client.clone())),
            cache: Arc::new(cache.clone()),
            providers: Arc::new(ProviderRegistry::builtin()),
            generators: Arc::new(GeneratorRegistry::builtin()),
            informers: Arc::new(informers),
            templates: TemplateEngine::new()?,
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            caches_ready: caches_ready.clone(),
        });

        tokio::spawn(metadata_driver);
        tokio::spawn(watch_deletions(bindings, ctx.clone()));
        let ready = self.ready.clone();
        tokio::spawn(async move {
            match cache.wait_until_ready().await {
                Ok(()) => {
                    info!("Target caches synced");
                    caches_ready.store(true, Ordering::Release);
                    ready.store(true, Ordering::Release);
                }
                Err(e) => error!("Target caches failed to sync: {}", e),
            }
        });

        info!(
            "Starting binding controller (class {}, {} concurrent reconciles)",
            self.config.controller_class, self.config.concurrent_reconciles
        );
        controller
            .watches_stream(secret_events, move |secret: Secret| {
                bindings_for_secret(&binding_store, &secret)
            })
            .reconcile_on(triggers)
            .with_config(ControllerConfig::default().concurrency(self.config.concurrent_reconciles))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled binding: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}
