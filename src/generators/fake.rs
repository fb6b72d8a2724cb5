// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use super::{Generator, GeneratorContext, GeneratorOutput};
use crate::error::Result;
use crate::types::generator::FakeSpec;
use async_trait::async_trait;
use serde_json::Value;

pub struct FakeGenerator;

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, spec: &Value, _ctx: &GeneratorContext<'_>) -> Result<GeneratorOutput> {
        let spec: FakeSpec = serde_json::from_value(spec.clone())?;
        let state = spec.stateful.then(|| serde_json::json!({ "data": spec.data }));
        Ok(GeneratorOutput {
            data: spec
                .data
                .into_iter()
                .map(|(k, v)| (k, v.into_bytes()))
                .collect(),
            state,
        })
    }
}
