// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use super::{Generator, GeneratorContext, GeneratorOutput};
use crate::error::Result;
use crate::sync::SecretData;
use async_trait::async_trait;
use serde_json::Value;

pub struct UuidGenerator;

#[async_trait]
impl Generator for UuidGenerator {
    async fn generate(&self, _spec: &Value, _ctx: &GeneratorContext<'_>) -> Result<GeneratorOutput> {
        Ok(GeneratorOutput {
            data: SecretData::from([(
                "uuid".to_string(),
                ::uuid::Uuid::new_v4().to_string().into_bytes(),
            )]),
            state: None,
        })
    }
}
