// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Generators produce secret values instead of reading them from a backend.

pub mod fake;
pub mod password;
pub mod state;
pub mod uuid;

use crate::error::{CourierError, Result};
use crate::kubernetes::ObjectStore;
use crate::sync::SecretData;
use crate::types::binding::GeneratorRef;
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::Resource;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use state::GeneratorStateTx;

#[derive(Debug, Default)]
pub struct GeneratorOutput {
    pub data: SecretData,
    /// Opaque state to persist; only stateful generators return one
    pub state: Option<Value>,
}

pub struct GeneratorContext<'a> {
    pub namespace: &'a str,
    pub objects: Arc<dyn ObjectStore>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// `spec` is the `spec` of the generator resource
    async fn generate(&self, spec: &Value, ctx: &GeneratorContext<'_>) -> Result<GeneratorOutput>;

    /// Release whatever a previously generated `state` holds on to.
    async fn cleanup(&self, _spec: &Value, _state: &Value, _ctx: &GeneratorContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct RegisteredGenerator {
    pub resource: ApiResource,
    pub generator: Arc<dyn Generator>,
}

#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    generators: HashMap<String, RegisteredGenerator>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::new()
            .with_kind::<crate::types::Password>(Arc::new(password::PasswordGenerator))
            .with_kind::<crate::types::UUID>(Arc::new(uuid::UuidGenerator))
            .with_kind::<crate::types::Fake>(Arc::new(fake::FakeGenerator))
    }

    pub fn with_kind<K: Resource<DynamicType = ()>>(self, generator: Arc<dyn Generator>) -> Self {
        self.with(ApiResource::erase::<K>(&()), generator)
    }

    pub fn with(mut self, resource: ApiResource, generator: Arc<dyn Generator>) -> Self {
        self.generators
            .insert(resource.kind.clone(), RegisteredGenerator { resource, generator });
        self
    }

    pub fn get(&self, kind: &str) -> Result<RegisteredGenerator> {
        self.generators
            .get(kind)
            .cloned()
            .ok_or_else(|| CourierError::GeneratorNotFound(format!("unknown generator kind {}", kind)))
    }
}

/// Controller class a generator resource is tagged with, if any.
pub fn generator_class(obj: &DynamicObject) -> Option<String> {
    obj.data
        .get("spec")
        .and_then(|s| s.get("controller"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

pub fn generator_spec(obj: &DynamicObject) -> Value {
    obj.data.get("spec").cloned().unwrap_or(Value::Null)
}

/// Look up the generator resource `reference` points at.
pub async fn resolve_generator(
    objects: &dyn ObjectStore,
    registry: &GeneratorRegistry,
    namespace: &str,
    reference: &GeneratorRef,
) -> Result<(RegisteredGenerator, DynamicObject)> {
    let registered = registry.get(&reference.kind)?;
    if registered.resource.api_version != reference.api_version {
        return Err(CourierError::GeneratorNotFound(format!(
            "{} is not served as {}",
            reference.kind, reference.api_version
        )));
    }
    let obj = objects
        .get(&registered.resource, Some(namespace), &reference.name)
        .await?
        .ok_or_else(|| CourierError::GeneratorNotFound(format!("{} {}", reference.kind, reference.name)))?;
    Ok((registered, obj))
}
