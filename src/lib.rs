// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod config;
pub mod constants;
pub mod error;
pub mod generators;
pub mod kubernetes;
pub mod metrics;
pub mod providers;
pub mod reconcilers;
pub mod server;
pub mod sync;
pub mod types;

#[cfg(test)]
pub mod test_utils;
