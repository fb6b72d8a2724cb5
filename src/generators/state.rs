// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Persisted generator state with staged commit.
//!
//! One transaction is opened per binding and aggregation pass. Changes are only
//! staged while the pass runs; `commit` persists them once the target write
//! succeeded and `rollback` hands freshly generated state back to its generator
//! for cleanup instead.

use super::{GeneratorContext, GeneratorRegistry};
use crate::constants::{labels, CONTROLLER_FIELD_MANAGER};
use crate::error::Result;
use crate::kubernetes::{list_typed, to_dynamic, ObjectStore};
use crate::types::generator::{GeneratorState, GeneratorStateSpec};
use chrono::{DateTime, Utc};
use kube::api::{ApiResource, ObjectMeta};
use kube::ResourceExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
enum Staged {
    SetLatest {
        key: String,
        generator_kind: String,
        resource: Value,
        state: Value,
    },
    FlagLatestForGc {
        key: String,
    },
    MoveToGc {
        key: String,
    },
}

pub struct GeneratorStateTx {
    objects: Arc<dyn ObjectStore>,
    generators: Arc<GeneratorRegistry>,
    namespace: String,
    binding_name: String,
    owner: String,
    gc_grace: Duration,
    staged: Mutex<Vec<Staged>>,
}

/// State key of the `index`th `dataFrom` entry
pub fn state_key(index: usize) -> String {
    format!("dataFrom.{}", index)
}

impl GeneratorStateTx {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        generators: Arc<GeneratorRegistry>,
        namespace: &str,
        binding_name: &str,
        owner: &str,
        gc_grace: Duration,
    ) -> Self {
        Self {
            objects,
            generators,
            namespace: namespace.to_string(),
            binding_name: binding_name.to_string(),
            owner: owner.to_string(),
            gc_grace,
            staged: Mutex::new(Vec::new()),
        }
    }

    async fn states(&self, key: Option<&str>) -> Result<Vec<GeneratorState>> {
        let mut selector = format!("{}={}", labels::STATE_OWNER, self.owner);
        if let Some(key) = key {
            selector.push_str(&format!(",{}={}", labels::STATE_KEY, key));
        }
        list_typed(self.objects.as_ref(), Some(&self.namespace), Some(&selector)).await
    }

    /// The state for `key` that is not flagged for garbage collection.
    pub async fn get_latest_state(&self, key: &str) -> Result<Option<GeneratorState>> {
        let mut live: Vec<GeneratorState> = self
            .states(Some(key))
            .await?
            .into_iter()
            .filter(|s| s.spec.garbage_collection_deadline.is_none())
            .collect();
        live.sort_by(|a, b| {
            (a.metadata.creation_timestamp.as_ref().map(|t| t.0), a.name_any())
                .cmp(&(b.metadata.creation_timestamp.as_ref().map(|t| t.0), b.name_any()))
        });
        Ok(live.pop())
    }

    /// Keys that still have live state.
    pub async fn live_keys(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .states(None)
            .await?
            .into_iter()
            .filter(|s| s.spec.garbage_collection_deadline.is_none())
            .filter_map(|s| s.labels().get(labels::STATE_KEY).cloned())
            .collect())
    }

    pub fn enqueue_set_latest(&self, key: &str, generator_kind: &str, resource: Value, state: Value) {
        self.stage(Staged::SetLatest {
            key: key.to_string(),
            generator_kind: generator_kind.to_string(),
            resource,
            state,
        });
    }

    /// Flag every live state of `key`, used when its data reference is gone.
    pub fn enqueue_move_state_to_gc(&self, key: &str) {
        self.stage(Staged::MoveToGc { key: key.to_string() });
    }

    /// Flag the current latest state of `key`, used before replacing it.
    pub fn enqueue_flag_latest_state_for_gc(&self, key: &str) {
        self.stage(Staged::FlagLatestForGc { key: key.to_string() });
    }

    fn stage(&self, op: Staged) {
        if let Ok(mut staged) = self.staged.lock() {
            staged.push(op);
        }
    }

    fn take_staged(&self) -> Vec<Staged> {
        self.staged
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.lock().map(|s| s.is_empty()).unwrap_or(true)
    }

    pub async fn commit(&self) -> Result<()> {
        for op in self.take_staged() {
            match op {
                Staged::SetLatest {
                    key,
                    generator_kind,
                    resource,
                    state,
                } => self.create_state(&key, &generator_kind, resource, state).await?,
                Staged::FlagLatestForGc { key } => {
                    if let Some(latest) = self.get_latest_state(&key).await? {
                        self.flag_for_gc(&latest).await?;
                    }
                }
                Staged::MoveToGc { key } => {
                    for state in self.states(Some(&key)).await? {
                        if state.spec.garbage_collection_deadline.is_none() {
                            self.flag_for_gc(&state).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Discard staged changes, cleaning up state that will never be persisted.
    pub async fn rollback(&self) {
        for op in self.take_staged() {
            if let Staged::SetLatest {
                key,
                generator_kind,
                resource,
                state,
            } = op
            {
                debug!("Rolling back generated state for {}", key);
                if let Err(e) = self.cleanup(&generator_kind, &resource, &state).await {
                    warn!("Cleanup of uncommitted {} state failed: {}", generator_kind, e);
                }
            }
        }
    }

    /// Clean up and delete states whose grace period has passed.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let now = Utc::now();
        let mut collected = 0;
        for state in self.states(None).await? {
            let expired = state
                .spec
                .garbage_collection_deadline
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .is_some_and(|d| d <= now);
            if !expired {
                continue;
            }
            if let Err(e) = self
                .cleanup(&state.spec.generator_kind, &state.spec.resource, &state.spec.state)
                .await
            {
                warn!("Cleanup of {} failed, keeping it: {}", state.name_any(), e);
                continue;
            }
            self.objects
                .delete(&state_resource(), Some(&self.namespace), &state.name_any())
                .await?;
            collected += 1;
        }
        if collected > 0 {
            info!("Collected {} generator states of {}", collected, self.binding_name);
        }
        Ok(collected)
    }

    async fn cleanup(&self, generator_kind: &str, resource: &Value, state: &Value) -> Result<()> {
        let registered = self.generators.get(generator_kind)?;
        let ctx = GeneratorContext {
            namespace: &self.namespace,
            objects: self.objects.clone(),
        };
        let spec = resource.get("spec").cloned().unwrap_or(Value::Null);
        registered.generator.cleanup(&spec, state, &ctx).await
    }

    async fn create_state(&self, key: &str, generator_kind: &str, resource: Value, state: Value) -> Result<()> {
        let prefix: String = self.binding_name.chars().take(200).collect();
        let suffix: String = ::uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let obj = GeneratorState {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}", prefix, suffix)),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (labels::STATE_OWNER.to_string(), self.owner.clone()),
                    (labels::STATE_KEY.to_string(), key.to_string()),
                ])),
                ..Default::default()
            },
            spec: GeneratorStateSpec {
                generator_kind: generator_kind.to_string(),
                resource,
                state,
                garbage_collection_deadline: None,
            },
        };
        self.objects
            .create(&state_resource(), &to_dynamic(&obj)?, CONTROLLER_FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn flag_for_gc(&self, state: &GeneratorState) -> Result<()> {
        let grace = chrono::Duration::from_std(self.gc_grace).unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = (Utc::now() + grace).to_rfc3339();
        debug!("Flagging {} for collection at {}", state.name_any(), deadline);
        self.objects
            .merge_patch(
                &state_resource(),
                Some(&self.namespace),
                &state.name_any(),
                &serde_json::json!({"spec": {"garbageCollectionDeadline": deadline}}),
            )
            .await?;
        Ok(())
    }
}

fn state_resource() -> ApiResource {
    ApiResource::erase::<GeneratorState>(&())
}
