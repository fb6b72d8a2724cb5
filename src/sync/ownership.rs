// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Field ownership read from `metadata.managedFields`.

use kube::api::ObjectMeta;
use serde_json::Value;
use std::collections::BTreeSet;

/// Payload keys, labels and annotations attributed to a field manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedFields {
    pub data: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub annotations: BTreeSet<String>,
}

impl OwnedFields {
    /// Parse a FieldsV1 document, e.g. `{"f:data":{"f:key":{}}}`.
    pub fn from_fields_v1(fields: &Value) -> Self {
        let mut owned = OwnedFields::default();
        owned.data = field_keys(fields.get("f:data"));
        if let Some(meta) = fields.get("f:metadata") {
            owned.labels = field_keys(meta.get("f:labels"));
            owned.annotations = field_keys(meta.get("f:annotations"));
        }
        owned
    }

    pub fn extend(&mut self, other: OwnedFields) {
        self.data.extend(other.data);
        self.labels.extend(other.labels);
        self.annotations.extend(other.annotations);
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.labels.is_empty() && self.annotations.is_empty()
    }
}

fn field_keys(section: Option<&Value>) -> BTreeSet<String> {
    section
        .and_then(Value::as_object)
        .map(|map| {
            map.keys()
                .filter_map(|k| k.strip_prefix("f:"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Fields `manager` holds across all of its managedFields entries.
pub fn owned_fields(meta: &ObjectMeta, manager: &str) -> OwnedFields {
    collect(meta, |m| m == manager)
}

/// Fields held by any manager other than `manager`.
pub fn fields_owned_by_others(meta: &ObjectMeta, manager: &str) -> OwnedFields {
    collect(meta, |m| m != manager)
}

fn collect(meta: &ObjectMeta, include: impl Fn(&str) -> bool) -> OwnedFields {
    let mut owned = OwnedFields::default();
    for entry in meta.managed_fields.iter().flatten() {
        let Some(manager) = entry.manager.as_deref() else {
            continue;
        };
        if !include(manager) {
            continue;
        }
        if let Some(fields) = &entry.fields_v1 {
            owned.extend(OwnedFields::from_fields_v1(&fields.0));
        }
    }
    owned
}
