// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Stores and generators tagged with another class are left alone
    pub controller_class: String,
    /// Only sync from stores whose Ready condition is not False
    pub enable_flood_gate: bool,
    pub enable_cluster_stores: bool,
    /// Allow targets of kinds other than Secret
    pub enable_generic_targets: bool,
    /// Restrict the watches to one namespace
    pub watch_namespace: Option<String>,
    pub concurrent_reconciles: u16,
    /// Delay before retrying a transient error
    pub error_requeue: Duration,
    /// How long a superseded generator state is kept before cleanup
    pub generator_gc_grace: Duration,
    pub metrics_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            controller_class: "default".to_string(),
            enable_flood_gate: true,
            enable_cluster_stores: true,
            enable_generic_targets: false,
            watch_namespace: None,
            concurrent_reconciles: 1,
            error_requeue: Duration::from_secs(10),
            generator_gc_grace: Duration::from_secs(300),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let controller_class =
            env::var("CONTROLLER_CLASS").unwrap_or(defaults.controller_class);
        let enable_flood_gate = bool_var("ENABLE_FLOOD_GATE", defaults.enable_flood_gate)?;
        let enable_cluster_stores =
            bool_var("ENABLE_CLUSTER_STORES", defaults.enable_cluster_stores)?;
        let enable_generic_targets =
            bool_var("ENABLE_GENERIC_TARGETS", defaults.enable_generic_targets)?;
        let watch_namespace = env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty());

        let concurrent_reconciles = match env::var("CONCURRENT_RECONCILES") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("CONCURRENT_RECONCILES is not a number: {}", v))?,
            Err(_) => defaults.concurrent_reconciles,
        };
        let error_requeue = secs_var("ERROR_REQUEUE_SECS", defaults.error_requeue)?;
        let generator_gc_grace =
            secs_var("GENERATOR_STATE_GC_GRACE_SECS", defaults.generator_gc_grace)?;
        let metrics_addr = env::var("METRICS_ADDR").unwrap_or(defaults.metrics_addr);

        Ok(Config {
            controller_class,
            enable_flood_gate,
            enable_cluster_stores,
            enable_generic_targets,
            watch_namespace,
            concurrent_reconciles,
            error_requeue,
            generator_gc_grace,
            metrics_addr,
        })
    }
}

fn bool_var(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{} must be true or false, got {}", name, v)),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map(Duration::from_secs)
            .with_context(|| format!("{} must be a number of seconds, got {}", name, v)),
        Err(_) => Ok(default),
    }
}
