// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use super::{Generator, GeneratorContext, GeneratorOutput};
use crate::error::{CourierError, Result};
use crate::sync::SecretData;
use crate::types::generator::PasswordSpec;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "~!@#$%^&*()_+`-={}|[]\\:\"<>?,./";

pub struct PasswordGenerator;

#[async_trait]
impl Generator for PasswordGenerator {
    async fn generate(&self, spec: &Value, _ctx: &GeneratorContext<'_>) -> Result<GeneratorOutput> {
        let spec: PasswordSpec = serde_json::from_value(spec.clone())?;
        let password = generate_password(&spec)?;
        Ok(GeneratorOutput {
            data: SecretData::from([("password".to_string(), password.into_bytes())]),
            state: None,
        })
    }
}

pub fn generate_password(spec: &PasswordSpec) -> Result<String> {
    let digits = spec.digits.unwrap_or(spec.length / 4);
    let symbols = spec.symbols.unwrap_or(spec.length / 4);
    if digits + symbols > spec.length {
        return Err(CourierError::BackendError(format!(
            "password of length {} cannot hold {} digits and {} symbols",
            spec.length, digits, symbols
        )));
    }

    let mut letters: Vec<char> = LOWER.chars().collect();
    if !spec.no_upper {
        letters.extend(UPPER.chars());
    }
    let digit_chars: Vec<char> = DIGITS.chars().collect();
    let symbol_chars: Vec<char> = spec
        .symbol_characters
        .as_deref()
        .unwrap_or(SYMBOLS)
        .chars()
        .collect();

    let mut rng = rand::thread_rng();
    let mut used = HashSet::new();
    let mut chars = Vec::with_capacity(spec.length);
    chars.extend(pick(&mut rng, &digit_chars, digits, spec.allow_repeat, &mut used)?);
    chars.extend(pick(&mut rng, &symbol_chars, symbols, spec.allow_repeat, &mut used)?);
    chars.extend(pick(
        &mut rng,
        &letters,
        spec.length - digits - symbols,
        spec.allow_repeat,
        &mut used,
    )?);
    chars.shuffle(&mut rng);
    Ok(chars.into_iter().collect())
}

fn pick<R: Rng>(
    rng: &mut R,
    alphabet: &[char],
    count: usize,
    allow_repeat: bool,
    used: &mut HashSet<char>,
) -> Result<Vec<char>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if allow_repeat {
        return (0..count)
            .map(|_| alphabet.choose(rng).copied())
            .collect::<Option<Vec<char>>>()
            .ok_or_else(|| CourierError::BackendError("empty character set".to_string()));
    }

    let available: Vec<char> = alphabet.iter().copied().filter(|c| !used.contains(c)).collect();
    if available.len() < count {
        return Err(CourierError::BackendError(format!(
            "not enough unique characters for {} positions",
            count
        )));
    }
    let picked: Vec<char> = available.choose_multiple(rng, count).copied().collect();
    used.extend(picked.iter().copied());
    Ok(picked)
}
