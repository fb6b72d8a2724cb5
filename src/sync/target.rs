// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The resource a binding writes to.
//!
//! Secrets keep their payload in `data` as base64. Generic kinds keep it as a
//! plain string map under a top-level `data` field; every other top-level
//! field of a generic object is carried through untouched.

use crate::constants::{annotations, labels};
use crate::error::Result;
use crate::kubernetes::{from_dynamic, to_dynamic};
use crate::sync::hash::data_hash;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type SecretData = BTreeMap<String, Vec<u8>>;

#[derive(Clone, Debug)]
pub enum TargetKind {
    Secret,
    Generic(ApiResource),
}

impl TargetKind {
    pub fn resource(&self) -> ApiResource {
        match self {
            TargetKind::Secret => ApiResource::erase::<Secret>(&()),
            TargetKind::Generic(ar) => ar.clone(),
        }
    }

    pub fn gvk(&self) -> Option<GroupVersionKind> {
        match self {
            TargetKind::Secret => None,
            TargetKind::Generic(ar) => Some(GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Target {
    pub metadata: ObjectMeta,
    pub data: SecretData,
    pub secret_type: Option<String>,
    pub immutable: Option<bool>,
    pub extra: Map<String, Value>,
}

impl Target {
    pub fn new(name: &str, namespace: &str) -> Self {
        Target {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn from_secret(secret: Secret) -> Self {
        Target {
            metadata: secret.metadata,
            data: secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect(),
            secret_type: secret.type_,
            immutable: secret.immutable,
            extra: Map::new(),
        }
    }

    pub fn into_secret(self) -> Secret {
        Secret {
            metadata: self.metadata,
            data: Some(
                self.data
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            type_: self.secret_type,
            immutable: self.immutable,
            ..Default::default()
        }
    }

    pub fn from_dynamic(kind: &TargetKind, obj: DynamicObject) -> Result<Self> {
        match kind {
            TargetKind::Secret => Ok(Target::from_secret(from_dynamic(obj)?)),
            TargetKind::Generic(_) => {
                let mut extra = match obj.data {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let data = match extra.remove("data") {
                    Some(Value::Object(map)) => map
                        .into_iter()
                        .map(|(k, v)| {
                            let bytes = match v {
                                Value::String(s) => s.into_bytes(),
                                other => other.to_string().into_bytes(),
                            };
                            (k, bytes)
                        })
                        .collect(),
                    _ => SecretData::new(),
                };
                Ok(Target {
                    metadata: obj.metadata,
                    data,
                    secret_type: None,
                    immutable: None,
                    extra,
                })
            }
        }
    }

    pub fn to_dynamic(&self, kind: &TargetKind) -> Result<DynamicObject> {
        match kind {
            TargetKind::Secret => to_dynamic(&self.clone().into_secret()),
            TargetKind::Generic(ar) => {
                let mut body = self.extra.clone();
                let data: Map<String, Value> = self
                    .data
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(String::from_utf8_lossy(v).into_owned())))
                    .collect();
                body.insert("data".to_string(), Value::Object(data));
                Ok(DynamicObject {
                    types: Some(TypeMeta {
                        api_version: ar.api_version.clone(),
                        kind: ar.kind.clone(),
                    }),
                    metadata: self.metadata.clone(),
                    data: Value::Object(body),
                })
            }
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata.labels.get_or_insert_with(BTreeMap::new)
    }

    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata.annotations.get_or_insert_with(BTreeMap::new)
    }

    pub fn is_managed(&self) -> bool {
        self.label(labels::MANAGED) == Some(labels::MANAGED_VALUE)
    }

    /// A target is valid when it carries the managed label and its payload
    /// still matches the data-hash annotation written with it.
    pub fn is_valid(&self) -> bool {
        if self.metadata.uid.is_none() || !self.is_managed() {
            return false;
        }
        self.annotation(annotations::DATA_HASH) == Some(data_hash(&self.data).as_str())
    }
}
