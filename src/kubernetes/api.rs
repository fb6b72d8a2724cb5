// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Object store access behind a trait so the reconciler can run against a fake.

use crate::constants::CONTROLLER_FIELD_MANAGER;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use kube::{
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// `label_selector` uses the `k=v,k2=v2` form
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject>;

    /// Full update guarded by the object's resourceVersion; a stale version is `Conflict`.
    async fn replace(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject>;

    /// Server-side apply; a field owned by another manager is `Conflict` unless forced.
    async fn apply(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<DynamicObject>;

    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Deleting an absent object is not an error
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()>;
}

/// `ObjectStore` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

fn object_id(resource: &ApiResource, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", resource.kind, ns, name),
        None => format!("{} {}", resource.kind, name),
    }
}

fn map_write_error(err: kube::Error, id: String) -> CourierError {
    match err {
        kube::Error::Api(ref e) if e.code == 409 => CourierError::Conflict(id),
        other => CourierError::KubeError(other),
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        Ok(self.api(resource, namespace).list(&lp).await?.items)
    }

    #[instrument(skip(self, resource, obj), fields(kind = %resource.kind, name = %obj.name_any()))]
    async fn create(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject> {
        let namespace = obj.namespace();
        let pp = PostParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        };
        self.api(resource, namespace.as_deref())
            .create(&pp, obj)
            .await
            .map_err(|e| map_write_error(e, object_id(resource, namespace.as_deref(), &obj.name_any())))
    }

    #[instrument(skip(self, resource, obj), fields(kind = %resource.kind, name = %obj.name_any()))]
    async fn replace(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject> {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let pp = PostParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        };
        self.api(resource, namespace.as_deref())
            .replace(&name, &pp, obj)
            .await
            .map_err(|e| map_write_error(e, object_id(resource, namespace.as_deref(), &name)))
    }

    #[instrument(skip(self, resource, obj), fields(kind = %resource.kind, name = %obj.name_any()))]
    async fn apply(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<DynamicObject> {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let mut pp = PatchParams::apply(field_manager);
        if force {
            pp = pp.force();
        }
        debug!(force, "Applying {}", name);
        self.api(resource, namespace.as_deref())
            .patch(&name, &pp, &Patch::Apply(obj))
            .await
            .map_err(|e| map_write_error(e, object_id(resource, namespace.as_deref(), &name)))
    }

    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let pp = PatchParams {
            field_manager: Some(CONTROLLER_FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(resource, namespace)
            .patch(name, &pp, &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error(e, object_id(resource, namespace, name)))
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let pp = PatchParams {
            field_manager: Some(CONTROLLER_FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(resource, namespace)
            .patch_status(name, &pp, &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error(e, object_id(resource, namespace, name)))?;
        Ok(())
    }

    #[instrument(skip(self, resource), fields(kind = %resource.kind))]
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Result<()> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Convert a typed resource into the dynamic form used by `ObjectStore`.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub async fn get_typed<K>(store: &dyn ObjectStore, namespace: Option<&str>, name: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let resource = ApiResource::erase::<K>(&());
    store
        .get(&resource, namespace, name)
        .await?
        .map(from_dynamic)
        .transpose()
}

pub async fn list_typed<K>(
    store: &dyn ObjectStore,
    namespace: Option<&str>,
    label_selector: Option<&str>,
) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let resource = ApiResource::erase::<K>(&());
    store
        .list(&resource, namespace, label_selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}
