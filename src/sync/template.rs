// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Rendering of target payload, labels and annotations.
//!
//! Templates are minijinja templates. The aggregated data is exposed as
//! top-level variables, so `{{ password }}` renders the `password` key. For
//! familiarity `{{ .password }}` is accepted as well. Precedence, lowest to
//! highest: existing payload (merge policy `Merge` only), `templateFrom`
//! entries in order, then `template.data`. The aggregated data itself is only
//! written when the template defines neither `data` nor `templateFrom`.

use crate::constants::annotations;
use crate::error::{CourierError, Result};
use crate::kubernetes::{get_typed, ObjectStore};
use crate::sync::target::{SecretData, Target};
use crate::types::binding::{TemplateFrom, TemplateMergePolicy, TemplateScope, TemplateSpec, TemplateTarget};
use crate::types::SecretBinding;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub struct TemplateEngine {
    env: Environment<'static>,
    leading_dot: Regex,
}

impl TemplateEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("b64enc", |value: String| STANDARD.encode(value));
        env.add_filter("b64dec", |value: String| -> std::result::Result<String, minijinja::Error> {
            let bytes = STANDARD
                .decode(value.trim())
                .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
            String::from_utf8(bytes).map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))
        });
        Ok(Self {
            env,
            leading_dot: Regex::new(r"(\{\{-?|\{%-?)(\s*)\.([A-Za-z_])")?,
        })
    }

    /// Render `template` with `vars` as its top-level variables.
    pub fn render(&self, template: &str, vars: &Map<String, Value>) -> Result<String> {
        let source = self.leading_dot.replace_all(template, "$1$2$3");
        Ok(self.env.render_str(&source, vars)?)
    }

    /// Render against secret data.
    pub fn render_data(&self, template: &str, data: &SecretData) -> Result<String> {
        self.render(template, &data_vars(data))
    }

    /// Render a fragment that must produce a YAML mapping.
    fn render_mapping(&self, template: &str, vars: &Map<String, Value>) -> Result<BTreeMap<String, String>> {
        let rendered = self.render(template, vars)?;
        if rendered.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let parsed: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&rendered)
            .map_err(|e| CourierError::TemplateError(format!("template did not render to a mapping: {}", e)))?;
        parsed
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Null => String::new(),
                    other => serde_yaml::to_string(&other)
                        .map(|s| s.trim_end().to_string())
                        .map_err(|e| CourierError::TemplateError(e.to_string()))?,
                };
                Ok((k, value))
            })
            .collect()
    }

    /// Compute labels, annotations and payload of `target` for `binding`.
    ///
    /// Fields previously written for the binding must already be stripped.
    pub fn apply(
        &self,
        binding: &SecretBinding,
        target: &mut Target,
        data: &SecretData,
        sources: &TemplateSources,
    ) -> Result<()> {
        let Some(template) = binding.spec.target.template.as_ref() else {
            copy_binding_metadata(binding, target);
            target.data = data.clone();
            return Ok(());
        };

        if let Some(type_) = template.type_.as_ref().filter(|t| !t.is_empty()) {
            target.secret_type = Some(type_.clone());
        }
        match template.merge_policy {
            TemplateMergePolicy::Replace => target.data.clear(),
            // aggregated data sits under the rendered entries
            TemplateMergePolicy::Merge => {
                target.data.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())))
            }
        }

        let vars = data_vars(data);
        for from in &template.template_from {
            self.apply_template_from(from, &vars, sources, target)?;
        }
        for (key, tpl) in &template.data {
            let rendered = self.render(tpl, &vars)?;
            target.data.insert(key.clone(), rendered.into_bytes());
        }
        if let Some(metadata) = &template.metadata {
            for (key, tpl) in &metadata.labels {
                let rendered = self.render(tpl, &vars)?;
                target.labels_mut().insert(key.clone(), rendered);
            }
            for (key, tpl) in &metadata.annotations {
                let rendered = self.render(tpl, &vars)?;
                target.annotations_mut().insert(key.clone(), rendered);
            }
        }

        if template.merge_policy == TemplateMergePolicy::Replace
            && template.data.is_empty()
            && template.template_from.is_empty()
        {
            target.data.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    fn apply_template_from(
        &self,
        from: &TemplateFrom,
        vars: &Map<String, Value>,
        sources: &TemplateSources,
        target: &mut Target,
    ) -> Result<()> {
        let mut rendered = BTreeMap::new();
        if let Some(literal) = &from.literal {
            rendered.extend(self.render_mapping(literal, vars)?);
        }
        for (source, store) in [
            (from.config_map.as_ref(), &sources.config_maps),
            (from.secret.as_ref(), &sources.secrets),
        ] {
            let Some(source) = source else {
                continue;
            };
            let content = store.get(&source.name).ok_or_else(|| {
                CourierError::TemplateError(format!("template source {} was not loaded", source.name))
            })?;
            let items: Vec<(String, TemplateScope)> = if source.items.is_empty() {
                content.keys().map(|k| (k.clone(), TemplateScope::Values)).collect()
            } else {
                source.items.iter().map(|i| (i.key.clone(), i.template_as)).collect()
            };
            for (key, scope) in items {
                let tpl = content.get(&key).ok_or_else(|| {
                    CourierError::TemplateError(format!("key {} not found in template source {}", key, source.name))
                })?;
                match scope {
                    TemplateScope::Values => {
                        rendered.insert(key, self.render(tpl, vars)?);
                    }
                    TemplateScope::KeysAndValues => rendered.extend(self.render_mapping(tpl, vars)?),
                }
            }
        }

        match from.target {
            TemplateTarget::Data => target
                .data
                .extend(rendered.into_iter().map(|(k, v)| (k, v.into_bytes()))),
            TemplateTarget::Labels => target.labels_mut().extend(rendered),
            TemplateTarget::Annotations => target.annotations_mut().extend(rendered),
        }
        Ok(())
    }
}

/// Template sources referenced by `templateFrom`, keyed by object name.
#[derive(Debug, Default, Clone)]
pub struct TemplateSources {
    pub config_maps: BTreeMap<String, BTreeMap<String, String>>,
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
}

/// Fetch the ConfigMaps and Secrets a template renders from.
pub async fn load_template_sources(
    objects: &dyn ObjectStore,
    namespace: &str,
    template: Option<&TemplateSpec>,
) -> Result<TemplateSources> {
    let mut sources = TemplateSources::default();
    let Some(template) = template else {
        return Ok(sources);
    };
    for from in &template.template_from {
        if let Some(cm_ref) = &from.config_map {
            let cm: ConfigMap = get_typed(objects, Some(namespace), &cm_ref.name)
                .await?
                .ok_or_else(|| CourierError::TemplateError(format!("ConfigMap {} not found", cm_ref.name)))?;
            sources
                .config_maps
                .insert(cm_ref.name.clone(), cm.data.unwrap_or_default());
        }
        if let Some(secret_ref) = &from.secret {
            let secret: Secret = get_typed(objects, Some(namespace), &secret_ref.name)
                .await?
                .ok_or_else(|| CourierError::TemplateError(format!("Secret {} not found", secret_ref.name)))?;
            let data = secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                .collect();
            sources.secrets.insert(secret_ref.name.clone(), data);
        }
    }
    Ok(sources)
}

fn data_vars(data: &SecretData) -> Map<String, Value> {
    data.iter()
        .map(|(k, v)| (k.clone(), Value::String(String::from_utf8_lossy(v).into_owned())))
        .collect()
}

fn copy_binding_metadata(binding: &SecretBinding, target: &mut Target) {
    if let Some(labels) = &binding.metadata.labels {
        target
            .labels_mut()
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(annots) = &binding.metadata.annotations {
        target.annotations_mut().extend(
            annots
                .iter()
                .filter(|(k, _)| k.as_str() != annotations::LAST_APPLIED)
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
}
