// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use kube::Client;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier::config::Config;
use courier::kubernetes::wait_for_crds;
use courier::metrics::PrometheusMetrics;
use courier::reconcilers::BindingReconciler;
use courier::server::{start_server, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting courier controller");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: controller_class={}, namespace={}",
        config.controller_class,
        config.watch_namespace.as_deref().unwrap_or("<all>")
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    info!("Waiting for courier CRDs to become available...");
    wait_for_crds(&client).await?;

    let metrics = Arc::new(PrometheusMetrics::new()?);
    let ready = Arc::new(AtomicBool::new(false));
    let server_state = Arc::new(ServerState {
        metrics: metrics.clone(),
        is_ready: ready.clone(),
    });
    let reconciler = BindingReconciler::new(client, config.clone(), metrics, ready);

    tokio::try_join!(
        start_server(&config.metrics_addr, server_state),
        reconciler.run()
    )?;

    warn!("Controller stopped");
    Ok(())
}
