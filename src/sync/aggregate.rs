// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Fetch, transform and merge everything a binding references.
//!
//! `dataFrom` entries are merged in order so later entries overwrite earlier
//! keys; `data` references are merged last and always win. Any error aborts
//! the pass before anything is written.

use crate::error::{CourierError, Result};
use crate::generators::state::state_key;
use crate::generators::{generator_spec, resolve_generator, GeneratorContext, GeneratorRegistry, GeneratorStateTx};
use crate::kubernetes::ObjectStore;
use crate::metrics::MetricsSink;
use crate::sync::clients::{ClientManager, StoreClient};
use crate::sync::rewrite::{convert_keys, decode_map, decode_value, rewrite, validate_keys};
use crate::sync::target::SecretData;
use crate::sync::template::TemplateEngine;
use crate::types::binding::{DataFromRef, DataRef, DeletionPolicy, GeneratorRef, SourceStatus, StoreRef};
use crate::types::SecretBinding;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct AggregateContext<'a> {
    pub binding: &'a SecretBinding,
    pub clients: &'a ClientManager,
    pub generators: &'a GeneratorRegistry,
    pub state: &'a GeneratorStateTx,
    pub templates: &'a TemplateEngine,
    pub objects: Arc<dyn ObjectStore>,
    pub metrics: &'a dyn MetricsSink,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Aggregated {
    pub data: SecretData,
    /// Per store key facts, sorted by store
    pub sources: Vec<SourceStatus>,
}

#[derive(Default)]
struct StoreInfo {
    stores: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>, BTreeSet<String>)>,
}

impl StoreInfo {
    fn found(&mut self, store: &str, key: &str) {
        self.stores.entry(store.to_string()).or_default().0.insert(key.to_string());
    }

    fn missing(&mut self, store: &str, key: &str) {
        self.stores.entry(store.to_string()).or_default().1.insert(key.to_string());
    }

    fn discovered<'k>(&mut self, store: &str, keys: impl Iterator<Item = &'k String>) {
        self.stores
            .entry(store.to_string())
            .or_default()
            .2
            .extend(keys.cloned());
    }

    fn into_status(self) -> Vec<SourceStatus> {
        self.stores
            .into_iter()
            .map(|(store, (found, missing, discovered))| SourceStatus {
                store,
                found_keys: found.into_iter().collect(),
                missing_keys: missing.into_iter().collect(),
                discovered_keys: discovered.into_iter().collect(),
            })
            .collect()
    }
}

/// Aggregate all data of the binding and close the pass's clients.
pub async fn aggregate(ctx: &AggregateContext<'_>) -> Result<Aggregated> {
    let result = collect(ctx).await;
    ctx.clients.close_all().await;
    result
}

#[instrument(skip(ctx), fields(binding = %ctx.binding.key()))]
async fn collect(ctx: &AggregateContext<'_>) -> Result<Aggregated> {
    let mut data = SecretData::new();
    let mut info = StoreInfo::default();
    let mut generator_keys = BTreeSet::new();

    for (index, entry) in ctx.binding.spec.data_from.iter().enumerate() {
        let fetched = if let Some(generator) = entry.generator_ref() {
            let key = state_key(index);
            generator_keys.insert(key.clone());
            match generate(ctx, &key, entry, generator).await {
                Err(CourierError::NoSecret(msg)) => {
                    debug!("Generator {} produced no value: {}", generator.name, msg);
                    continue;
                }
                other => other?,
            }
        } else {
            match fetch_data_from(ctx, index, entry, &mut info).await {
                Err(CourierError::NoSecret(msg)) if !retains(ctx) => {
                    debug!("Skipping dataFrom[{}]: {}", index, msg);
                    continue;
                }
                other => other?,
            }
        };
        data.extend(fetched);
    }

    for stale in ctx.state.live_keys().await? {
        if !generator_keys.contains(&stale) {
            debug!("Generator state {} is no longer referenced", stale);
            ctx.state.enqueue_move_state_to_gc(&stale);
        }
    }

    for data_ref in &ctx.binding.spec.data {
        match fetch_data_ref(ctx, data_ref, &mut info).await {
            Ok(value) => {
                data.insert(data_ref.secret_key.clone(), value);
            }
            Err(CourierError::NoSecret(msg)) if !retains(ctx) => {
                debug!("Skipping {}: {}", data_ref.secret_key, msg);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Aggregated {
        data,
        sources: info.into_status(),
    })
}

fn retains(ctx: &AggregateContext<'_>) -> bool {
    ctx.binding.spec.target.deletion_policy == DeletionPolicy::Retain
}

async fn client_for(ctx: &AggregateContext<'_>, entry_store: Option<&StoreRef>) -> Result<StoreClient> {
    ctx.clients
        .get(ctx.binding.spec.secret_store_ref.as_ref(), entry_store)
        .await
}

fn record<T>(ctx: &AggregateContext<'_>, client: &StoreClient, call: &str, result: &Result<T>) {
    let ok = matches!(result, Ok(_) | Err(CourierError::NoSecret(_)));
    ctx.metrics.backend_call(client.provider, call, ok);
}

async fn fetch_data_from(
    ctx: &AggregateContext<'_>,
    index: usize,
    entry: &DataFromRef,
    info: &mut StoreInfo,
) -> Result<SecretData> {
    let client = client_for(ctx, entry.store_ref()).await?;
    let what = format!("dataFrom[{}]", index);

    let (fetched, conversion, decoding) = match (&entry.find, &entry.extract) {
        (Some(find), None) => {
            let result = client.client.get_all_secrets(find).await;
            record(ctx, &client, "GetAllSecrets", &result);
            (result?, find.conversion_strategy, find.decoding_strategy)
        }
        (None, Some(extract)) => {
            let result = client.client.get_secret_map(extract).await;
            record(ctx, &client, "GetSecretMap", &result);
            if let Err(CourierError::NoSecret(_)) = &result {
                info.missing(&client.store, &extract.key);
            }
            let map = result?;
            info.found(&client.store, &extract.key);
            (map, extract.conversion_strategy, extract.decoding_strategy)
        }
        _ => {
            return Err(CourierError::InvalidBinding(format!(
                "{} needs exactly one of find, extract or a generator",
                what
            )))
        }
    };

    let keyed = if entry.rewrite.is_empty() {
        convert_keys(conversion, fetched)?
    } else {
        rewrite(&entry.rewrite, fetched, ctx.templates)?
    };
    validate_keys(&what, &keyed)?;
    if entry.find.is_some() {
        info.discovered(&client.store, keyed.keys());
    }
    decode_map(decoding, keyed)
}

async fn generate(
    ctx: &AggregateContext<'_>,
    key: &str,
    entry: &DataFromRef,
    reference: &GeneratorRef,
) -> Result<SecretData> {
    let namespace = ctx.binding.namespace().unwrap_or_default();
    let (registered, obj) =
        resolve_generator(ctx.objects.as_ref(), ctx.generators, &namespace, reference).await?;
    let gen_ctx = GeneratorContext {
        namespace: &namespace,
        objects: ctx.objects.clone(),
    };
    let output = registered
        .generator
        .generate(&generator_spec(&obj), &gen_ctx)
        .await?;

    if let Some(state) = output.state {
        if ctx.state.get_latest_state(key).await?.is_some() {
            ctx.state.enqueue_flag_latest_state_for_gc(key);
        }
        ctx.state
            .enqueue_set_latest(key, &reference.kind, serde_json::to_value(&obj)?, state);
    }

    let data = if entry.rewrite.is_empty() {
        output.data
    } else {
        rewrite(&entry.rewrite, output.data, ctx.templates)?
    };
    validate_keys(key, &data)?;
    Ok(data)
}

async fn fetch_data_ref(ctx: &AggregateContext<'_>, data_ref: &DataRef, info: &mut StoreInfo) -> Result<Vec<u8>> {
    let source = data_ref.source_ref.as_ref();
    if source.is_some_and(|s| s.generator_ref.is_some()) {
        return Err(CourierError::InvalidBinding(format!(
            "data reference {} cannot use a generator, use dataFrom",
            data_ref.secret_key
        )));
    }
    validate_keys("data", &SecretData::from([(data_ref.secret_key.clone(), Vec::new())]))?;

    let client = client_for(ctx, source.and_then(|s| s.store_ref.as_ref())).await?;
    let result = client.client.get_secret(&data_ref.remote_ref).await;
    record(ctx, &client, "GetSecret", &result);
    match result {
        Ok(value) => {
            info.found(&client.store, &data_ref.remote_ref.key);
            decode_value(data_ref.remote_ref.decoding_strategy, &data_ref.secret_key, &value)
        }
        Err(e) => {
            if let CourierError::NoSecret(_) = e {
                info.missing(&client.store, &data_ref.remote_ref.key);
            }
            Err(e)
        }
    }
}
