// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Content hashes stamped on targets and bindings.

use crate::sync::target::SecretData;
use crate::types::SecretBinding;
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::ResourceExt;
use serde::Serialize;
use std::collections::BTreeMap;

/// md5 over the JSON encoding of `value`
pub fn object_hash<T: Serialize>(value: &T) -> String {
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", md5::compute(encoded))
}

/// Hash of a target payload, stored in the data-hash annotation.
pub fn data_hash(data: &SecretData) -> String {
    let encoded: BTreeMap<&str, String> = data
        .iter()
        .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
        .collect();
    object_hash(&encoded)
}

/// `<generation>-<hash of labels and annotations>` of a binding.
pub fn fingerprint(binding: &SecretBinding) -> String {
    #[derive(Serialize)]
    struct Meta<'a> {
        annotations: &'a BTreeMap<String, String>,
        labels: &'a BTreeMap<String, String>,
    }

    let meta = Meta {
        annotations: binding.annotations(),
        labels: binding.labels(),
    };
    format!(
        "{}-{}",
        binding.metadata.generation.unwrap_or_default(),
        object_hash(&meta)
    )
}

/// Label-safe hash identifying a binding, used on targets and generator states.
pub fn owner_hash(namespace: &str, name: &str) -> String {
    object_hash(&format!("{}/{}", namespace, name))
}
