// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconciler metrics.
//!
//! The reconciler only talks to the `MetricsSink` trait. `PrometheusMetrics`
//! owns its registry, so every reconciler instance (and every test) gets its
//! own set of series.
//!
//! Exposed series:
//! - `courier_sync_total{binding}` - successful syncs
//! - `courier_sync_errors_total{binding,reason}` - failed syncs by condition reason
//! - `courier_binding_ready{binding}` - 1 when the binding is Ready, 0 otherwise
//! - `courier_backend_calls_total{provider,call,result}` - backend client calls
//! - `courier_reconcile_duration_seconds` - duration of reconciliation passes

use crate::constants::conditions;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub trait MetricsSink: Send + Sync {
    fn sync_succeeded(&self, binding: &str);
    fn sync_failed(&self, binding: &str, reason: &str);
    fn set_ready(&self, binding: &str, ready: bool);
    fn backend_call(&self, provider: &str, call: &str, ok: bool);
    fn observe_reconcile(&self, seconds: f64);
    /// Drop every series of a deleted binding
    fn binding_deleted(&self, binding: &str);
}

pub struct PrometheusMetrics {
    registry: Registry,
    syncs: IntCounterVec,
    sync_errors: IntCounterVec,
    ready: IntGaugeVec,
    backend_calls: IntCounterVec,
    reconcile_duration: Histogram,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let syncs = IntCounterVec::new(
            Opts::new("courier_sync_total", "Total number of successful syncs"),
            &["binding"],
        )?;
        let sync_errors = IntCounterVec::new(
            Opts::new("courier_sync_errors_total", "Total number of failed syncs"),
            &["binding", "reason"],
        )?;
        let ready = IntGaugeVec::new(
            Opts::new("courier_binding_ready", "Ready condition of a binding"),
            &["binding"],
        )?;
        let backend_calls = IntCounterVec::new(
            Opts::new("courier_backend_calls_total", "Total number of backend client calls"),
            &["provider", "call", "result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "courier_reconcile_duration_seconds",
                "Duration of reconciliation in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(syncs.clone()))?;
        registry.register(Box::new(sync_errors.clone()))?;
        registry.register(Box::new(ready.clone()))?;
        registry.register(Box::new(backend_calls.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            syncs,
            sync_errors,
            ready,
            backend_calls,
            reconcile_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl MetricsSink for PrometheusMetrics {
    fn sync_succeeded(&self, binding: &str) {
        self.syncs.with_label_values(&[binding]).inc();
    }

    fn sync_failed(&self, binding: &str, reason: &str) {
        self.sync_errors.with_label_values(&[binding, reason]).inc();
    }

    fn set_ready(&self, binding: &str, ready: bool) {
        self.ready.with_label_values(&[binding]).set(i64::from(ready));
    }

    fn backend_call(&self, provider: &str, call: &str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.backend_calls.with_label_values(&[provider, call, result]).inc();
    }

    fn observe_reconcile(&self, seconds: f64) {
        self.reconcile_duration.observe(seconds);
    }

    fn binding_deleted(&self, binding: &str) {
        let _ = self.syncs.remove_label_values(&[binding]);
        let _ = self.ready.remove_label_values(&[binding]);
        for reason in conditions::FAILURE_REASONS {
            let _ = self.sync_errors.remove_label_values(&[binding, reason]);
        }
    }
}

/// Sink that records nothing.
#[derive(Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn sync_succeeded(&self, _binding: &str) {}
    fn sync_failed(&self, _binding: &str, _reason: &str) {}
    fn set_ready(&self, _binding: &str, _ready: bool) {}
    fn backend_call(&self, _provider: &str, _call: &str, _ok: bool) {}
    fn observe_reconcile(&self, _seconds: f64) {}
    fn binding_deleted(&self, _binding: &str) {}
}
