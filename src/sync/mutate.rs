// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Writing the rendered result to the target under a creation policy.
//!
//! Every binding writes with its own field manager, so the fields it wrote
//! last time can be told apart from fields written by anyone else. Before
//! rendering, those fields are stripped; whatever the template no longer
//! produces disappears from the target.

use crate::constants::{annotations, field_manager_for, labels};
use crate::error::{CourierError, Result};
use crate::kubernetes::ObjectStore;
use crate::sync::hash::{data_hash, owner_hash};
use crate::sync::ownership::{fields_owned_by_others, owned_fields};
use crate::sync::target::{SecretData, Target, TargetKind};
use crate::sync::template::{TemplateEngine, TemplateSources};
use crate::types::binding::CreationPolicy;
use crate::types::SecretBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Creation policy forbids writing
    Skipped,
    Unchanged,
    Created,
    Updated,
    /// Merged into a target owned by someone else
    Patched,
    Deleted,
}

impl MutationOutcome {
    pub fn wrote(&self) -> bool {
        !matches!(self, MutationOutcome::Skipped | MutationOutcome::Unchanged)
    }
}

/// What a binding wants written to its target.
pub struct Desired<'a> {
    pub binding: &'a SecretBinding,
    pub kind: &'a TargetKind,
    pub data: &'a SecretData,
    pub sources: &'a TemplateSources,
}

impl Desired<'_> {
    fn manager(&self) -> String {
        field_manager_for(&self.binding.name_any())
    }

    fn target_id(&self) -> String {
        format!(
            "{}/{}",
            self.binding.namespace().unwrap_or_default(),
            self.binding.target_name()
        )
    }
}

pub struct Mutator<'a> {
    objects: &'a dyn ObjectStore,
    templates: &'a TemplateEngine,
}

impl<'a> Mutator<'a> {
    pub fn new(objects: &'a dyn ObjectStore, templates: &'a TemplateEngine) -> Self {
        Self { objects, templates }
    }

    /// Write `desired` over `existing` according to the binding's creation policy.
    #[instrument(skip_all, fields(binding = %desired.binding.key(), target = %desired.binding.target_name()))]
    pub async fn apply(&self, desired: &Desired<'_>, existing: Option<Target>) -> Result<MutationOutcome> {
        match desired.binding.spec.target.creation_policy {
            CreationPolicy::None => Ok(MutationOutcome::Skipped),
            CreationPolicy::Merge => {
                let current = existing.ok_or_else(|| CourierError::TargetMissing(desired.target_id()))?;
                self.merge(desired, current).await
            }
            CreationPolicy::Orphan | CreationPolicy::Owner => {
                let outcome = self.create_or_update(desired, existing).await?;
                if desired.binding.spec.target.creation_policy == CreationPolicy::Owner {
                    self.delete_orphans(desired).await?;
                }
                Ok(outcome)
            }
        }
    }

    /// Delete the target, used when all backend data disappeared.
    pub async fn delete_target(&self, desired: &Desired<'_>, existing: Option<&Target>) -> Result<MutationOutcome> {
        let Some(target) = existing else {
            return Ok(MutationOutcome::Unchanged);
        };
        info!("Deleting {} as its backend data is gone", desired.target_id());
        self.objects
            .delete(
                &desired.kind.resource(),
                target.metadata.namespace.as_deref(),
                &target.metadata.name.clone().unwrap_or_default(),
            )
            .await?;
        Ok(MutationOutcome::Deleted)
    }

    /// Strip what this binding wrote before and render the new content on top.
    pub fn render(&self, desired: &Desired<'_>, target: &mut Target) -> Result<()> {
        let binding = desired.binding;
        let owned = owned_fields(&target.metadata, &desired.manager());
        for key in &owned.data {
            target.data.remove(key);
        }
        for key in &owned.labels {
            target.labels_mut().remove(key);
        }
        for key in &owned.annotations {
            target.annotations_mut().remove(key);
        }

        self.templates.apply(binding, target, desired.data, desired.sources)?;

        if binding.spec.target.immutable {
            target.immutable = Some(true);
        }
        let namespace = binding.namespace().unwrap_or_default();
        let target_labels = target.labels_mut();
        if binding.spec.target.creation_policy == CreationPolicy::Owner {
            target_labels.insert(labels::OWNER.to_string(), owner_hash(&namespace, &binding.name_any()));
        } else {
            target_labels.remove(labels::OWNER);
        }
        target_labels.insert(labels::MANAGED.to_string(), labels::MANAGED_VALUE.to_string());
        let hash = data_hash(&target.data);
        target.annotations_mut().insert(annotations::DATA_HASH.to_string(), hash);
        Ok(())
    }

    async fn create_or_update(&self, desired: &Desired<'_>, existing: Option<Target>) -> Result<MutationOutcome> {
        let resource = desired.kind.resource();
        let manager = desired.manager();
        let owner = desired.binding.spec.target.creation_policy == CreationPolicy::Owner;

        let Some(current) = existing else {
            let namespace = desired.binding.namespace().unwrap_or_default();
            let mut target = Target::new(&desired.binding.target_name(), &namespace);
            self.render(desired, &mut target)?;
            if owner {
                set_controller_reference(desired.binding, &mut target, &desired.target_id())?;
            }
            self.objects
                .create(&resource, &target.to_dynamic(desired.kind)?, &manager)
                .await?;
            info!("Created {}", desired.target_id());
            return Ok(MutationOutcome::Created);
        };

        let mut target = current.clone();
        if owner {
            set_controller_reference(desired.binding, &mut target, &desired.target_id())?;
        } else {
            remove_owner_reference(desired.binding, &mut target);
        }
        self.render(desired, &mut target)?;

        if target == current {
            debug!("{} is up to date", desired.target_id());
            return Ok(MutationOutcome::Unchanged);
        }
        if current.immutable == Some(true) && target.data != current.data {
            return Err(CourierError::Immutable(desired.target_id()));
        }
        self.objects
            .replace(&resource, &target.to_dynamic(desired.kind)?, &manager)
            .await?;
        info!("Updated {}", desired.target_id());
        Ok(MutationOutcome::Updated)
    }

    /// Server-side apply of only this binding's fields onto a target someone else owns.
    async fn merge(&self, desired: &Desired<'_>, current: Target) -> Result<MutationOutcome> {
        let manager = desired.manager();
        let resource = desired.kind.resource();

        let mut fresh = Target::new(
            &current.metadata.name.clone().unwrap_or_default(),
            &current.metadata.namespace.clone().unwrap_or_default(),
        );
        self.templates
            .apply(desired.binding, &mut fresh, desired.data, desired.sources)?;
        if desired.binding.spec.target.immutable {
            fresh.immutable = Some(true);
        }
        fresh
            .labels_mut()
            .insert(labels::MANAGED.to_string(), labels::MANAGED_VALUE.to_string());

        let contested = overwrites_foreign_fields(&manager, &current, &fresh);
        if contested {
            warn!(
                "Fields of {} are held by other writers, applying only fields courier held before",
                desired.target_id()
            );
            drop_foreign_fields(&manager, &current, &mut fresh);
        }

        if self.merge_is_noop(&manager, &current, &fresh) {
            debug!("{} already carries the merged fields", desired.target_id());
            return Ok(MutationOutcome::Unchanged);
        }
        let predicted = predicted_payload(&manager, &current, &fresh);
        if current.immutable == Some(true) && predicted != current.data {
            return Err(CourierError::Immutable(desired.target_id()));
        }
        fresh
            .annotations_mut()
            .insert(annotations::DATA_HASH.to_string(), data_hash(&predicted));

        match self
            .objects
            .apply(&resource, &fresh.to_dynamic(desired.kind)?, &manager, contested)
            .await
        {
            Ok(_) => {}
            // another writer took a field between the read and the apply
            Err(CourierError::Conflict(_)) if !contested => {
                warn!(
                    "Fields of {} were taken by other writers, applying only fields courier held before",
                    desired.target_id()
                );
                drop_foreign_fields(&manager, &current, &mut fresh);
                let predicted = predicted_payload(&manager, &current, &fresh);
                fresh
                    .annotations_mut()
                    .insert(annotations::DATA_HASH.to_string(), data_hash(&predicted));
                self.objects
                    .apply(&resource, &fresh.to_dynamic(desired.kind)?, &manager, true)
                    .await?;
            }
            Err(e) => return Err(e),
        }
        info!("Merged into {}", desired.target_id());
        Ok(MutationOutcome::Patched)
    }

    fn merge_is_noop(&self, manager: &str, current: &Target, fresh: &Target) -> bool {
        let owned = owned_fields(&current.metadata, manager);
        let stale_data = owned.data.iter().any(|k| !fresh.data.contains_key(k));
        let stale_labels = owned
            .labels
            .iter()
            .any(|k| !fresh.metadata.labels.as_ref().is_some_and(|l| l.contains_key(k)));
        let stale_annotations = owned
            .annotations
            .iter()
            .filter(|k| k.as_str() != annotations::DATA_HASH)
            .any(|k| !fresh.metadata.annotations.as_ref().is_some_and(|a| a.contains_key(k)));
        if stale_data || stale_labels || stale_annotations {
            return false;
        }
        let data_same = fresh.data.iter().all(|(k, v)| current.data.get(k) == Some(v));
        let labels_same = fresh
            .metadata
            .labels
            .iter()
            .flatten()
            .all(|(k, v)| current.label(k) == Some(v.as_str()));
        let annotations_same = fresh
            .metadata
            .annotations
            .iter()
            .flatten()
            .all(|(k, v)| current.annotation(k) == Some(v.as_str()));
        let immutable_same = fresh.immutable.is_none() || fresh.immutable == current.immutable;
        data_same
            && labels_same
            && annotations_same
            && immutable_same
            && current.annotation(annotations::DATA_HASH) == Some(data_hash(&current.data).as_str())
    }

    /// Delete targets this binding owned under a previous target name.
    async fn delete_orphans(&self, desired: &Desired<'_>) -> Result<()> {
        let binding = desired.binding;
        let namespace = binding.namespace().unwrap_or_default();
        let selector = format!("{}={}", labels::OWNER, owner_hash(&namespace, &binding.name_any()));
        let resource = desired.kind.resource();
        let uid = binding.uid().unwrap_or_default();
        let target_name = binding.target_name();

        for obj in self.objects.list(&resource, Some(&namespace), Some(&selector)).await? {
            let name = obj.name_any();
            if name == target_name {
                continue;
            }
            let owned_by_us = obj
                .owner_references()
                .iter()
                .any(|r| r.controller == Some(true) && r.uid == uid);
            if owned_by_us {
                info!("Deleting orphaned {}/{}", namespace, name);
                self.objects.delete(&resource, Some(&namespace), &name).await?;
            }
        }
        Ok(())
    }
}

fn binding_reference(binding: &SecretBinding) -> OwnerReference {
    OwnerReference {
        api_version: SecretBinding::api_version(&()).to_string(),
        kind: SecretBinding::kind(&()).to_string(),
        name: binding.name_any(),
        uid: binding.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Make the binding the controlling owner; fails when another controller owns the target.
fn set_controller_reference(binding: &SecretBinding, target: &mut Target, target_id: &str) -> Result<()> {
    let reference = binding_reference(binding);
    let refs = target.metadata.owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != reference.uid)
    {
        return Err(CourierError::AlreadyOwned {
            target: target_id.to_string(),
            owner: format!("{} {}", other.kind, other.name),
        });
    }
    refs.retain(|r| r.uid != reference.uid);
    refs.push(reference);
    Ok(())
}

fn remove_owner_reference(binding: &SecretBinding, target: &mut Target) {
    let uid = binding.uid().unwrap_or_default();
    if let Some(refs) = target.metadata.owner_references.as_mut() {
        refs.retain(|r| r.uid != uid);
        if refs.is_empty() {
            target.metadata.owner_references = None;
        }
    }
}

/// Payload after applying `fresh`: our stale keys vanish, everything else stays.
fn predicted_payload(manager: &str, current: &Target, fresh: &Target) -> SecretData {
    let owned = owned_fields(&current.metadata, manager);
    let others = fields_owned_by_others(&current.metadata, manager);
    let mut data = current.data.clone();
    data.retain(|k, _| !owned.data.contains(k) || others.data.contains(k) || fresh.data.contains_key(k));
    data.extend(fresh.data.iter().map(|(k, v)| (k.clone(), v.clone())));
    data
}

/// Whether `fresh` changes the value of a field another manager holds and this one never did.
fn overwrites_foreign_fields(manager: &str, current: &Target, fresh: &Target) -> bool {
    let owned = owned_fields(&current.metadata, manager);
    let others = fields_owned_by_others(&current.metadata, manager);
    let foreign = |theirs: &BTreeSet<String>, mine: &BTreeSet<String>, key: &str| {
        theirs.contains(key) && !mine.contains(key)
    };
    let data_contested = fresh
        .data
        .iter()
        .any(|(k, v)| foreign(&others.data, &owned.data, k.as_str()) && current.data.get(k) != Some(v));
    let labels_contested = fresh
        .metadata
        .labels
        .iter()
        .flatten()
        .any(|(k, v)| foreign(&others.labels, &owned.labels, k.as_str()) && current.label(k) != Some(v.as_str()));
    let annotations_contested = fresh
        .metadata
        .annotations
        .iter()
        .flatten()
        .filter(|(k, _)| k.as_str() != annotations::DATA_HASH)
        .any(|(k, v)| {
            foreign(&others.annotations, &owned.annotations, k.as_str()) && current.annotation(k) != Some(v.as_str())
        });
    data_contested || labels_contested || annotations_contested
}

/// Remove fields from `fresh` that another manager holds and this one never did.
fn drop_foreign_fields(manager: &str, current: &Target, fresh: &mut Target) {
    let owned = owned_fields(&current.metadata, manager);
    let others = fields_owned_by_others(&current.metadata, manager);
    fresh
        .data
        .retain(|k, _| !others.data.contains(k) || owned.data.contains(k));
    if let Some(l) = fresh.metadata.labels.as_mut() {
        l.retain(|k, _| k == labels::MANAGED || !others.labels.contains(k) || owned.labels.contains(k));
    }
    if let Some(a) = fresh.metadata.annotations.as_mut() {
        a.retain(|k, _| {
            k == annotations::DATA_HASH || !others.annotations.contains(k) || owned.annotations.contains(k)
        });
    }
}
