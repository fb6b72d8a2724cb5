// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Random password generator.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(
    group = "generators.courier.geeko.me",
    version = "v1alpha1",
    kind = "Password",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default = "default_password_length")]
    pub length: usize,
    /// Number of digits, a quarter of the length when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digits: Option<usize>,
    /// Number of symbols, a quarter of the length when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_characters: Option<String>,
    #[serde(default)]
    pub no_upper: bool,
    #[serde(default)]
    pub allow_repeat: bool,
}

fn default_password_length() -> usize {
    24
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(
    group = "generators.courier.geeko.me",
    version = "v1alpha1",
    kind = "UUID",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UUIDSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
}

/// Static data, mostly useful for testing pipelines.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(
    group = "generators.courier.geeko.me",
    version = "v1alpha1",
    kind = "Fake",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FakeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Emit the generated data as generator state
    #[serde(default)]
    pub stateful: bool,
}

/// State persisted by a stateful generator for one binding data reference.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(
    group = "generators.courier.geeko.me",
    version = "v1alpha1",
    kind = "GeneratorState",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorStateSpec {
    pub generator_kind: String,
    /// Snapshot of the generator resource that produced the state
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub resource: serde_json::Value,
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub state: serde_json::Value,
    /// RFC3339 time after which the state may be cleaned up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_deadline: Option<String>,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::json!(true),
    );
    Schema::Object(schema)
}
