// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Key rewriting, legacy key conversion, key validation and value decoding.

use crate::error::{CourierError, Result};
use crate::sync::target::SecretData;
use crate::sync::template::TemplateEngine;
use crate::types::binding::{ConversionStrategy, DecodingStrategy, RewriteRule};
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::Regex;
use serde_json::{Map, Value};

const MAX_KEY_LENGTH: usize = 253;

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
}

/// Apply rewrite rules in order to every key of `data`.
pub fn rewrite(rules: &[RewriteRule], data: SecretData, templates: &TemplateEngine) -> Result<SecretData> {
    let mut current = data;
    for rule in rules {
        current = match (&rule.regexp, &rule.transform) {
            (Some(re), None) => {
                let source = Regex::new(&re.source)?;
                rename(current, |key| Ok(source.replace_all(key, re.target.as_str()).into_owned()))?
            }
            (None, Some(transform)) => rename(current, |key| {
                let vars = Map::from_iter([("value".to_string(), Value::String(key.to_string()))]);
                templates.render(&transform.template, &vars)
            })?,
            _ => {
                return Err(CourierError::InvalidBinding(
                    "a rewrite rule needs exactly one of regexp or transform".to_string(),
                ))
            }
        };
    }
    Ok(current)
}

fn rename(data: SecretData, f: impl Fn(&str) -> Result<String>) -> Result<SecretData> {
    let mut out = SecretData::new();
    for (key, value) in data {
        let new_key = f(&key)?;
        if out.insert(new_key.clone(), value).is_some() {
            return Err(CourierError::KeyCollision(format!(
                "rewriting {} produced the already used key {}",
                key, new_key
            )));
        }
    }
    Ok(out)
}

/// Replace characters that are not valid in a secret key.
pub fn convert_keys(strategy: ConversionStrategy, data: SecretData) -> Result<SecretData> {
    if strategy == ConversionStrategy::None {
        return Ok(data);
    }
    rename(data, |key| {
        Ok(key
            .chars()
            .map(|c| {
                if is_key_char(c) {
                    c.to_string()
                } else if strategy == ConversionStrategy::Unicode {
                    format!("_U{:04x}_", c as u32)
                } else {
                    "_".to_string()
                }
            })
            .collect())
    })
}

/// Every key must be a valid secret key; the first offending key fails the whole map.
pub fn validate_keys(what: &str, data: &SecretData) -> Result<()> {
    let invalid: Vec<&str> = data
        .keys()
        .filter(|k| k.is_empty() || k.len() > MAX_KEY_LENGTH || !k.chars().all(is_key_char))
        .map(String::as_str)
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(CourierError::InvalidKeys(format!("{}: {}", what, invalid.join(", "))))
    }
}

pub fn decode_value(strategy: DecodingStrategy, key: &str, value: &[u8]) -> Result<Vec<u8>> {
    let fail = |e: base64::DecodeError| CourierError::DecodingError(format!("{}: {}", key, e));
    match strategy {
        DecodingStrategy::None => Ok(value.to_vec()),
        DecodingStrategy::Base64 => STANDARD.decode(value).map_err(fail),
        DecodingStrategy::Base64Url => URL_SAFE.decode(value).or_else(|_| URL_SAFE_NO_PAD.decode(value)).map_err(fail),
        DecodingStrategy::Auto => Ok(STANDARD
            .decode(value)
            .or_else(|_| URL_SAFE.decode(value))
            .unwrap_or_else(|_| value.to_vec())),
    }
}

pub fn decode_map(strategy: DecodingStrategy, data: SecretData) -> Result<SecretData> {
    data.into_iter()
        .map(|(k, v)| {
            let decoded = decode_value(strategy, &k, &v)?;
            Ok((k, decoded))
        })
        .collect()
}
