//! The Knot tap/target lifecycle orchestrator.

mod app;
mod config;
#[cfg(test)]
mod config_test;
mod error;
#[cfg(test)]
mod fixtures;
mod logs;
mod models;
mod runner;
mod server;
mod session;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;
use crate::error::ShutdownError;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::new(&cfg.rust_log))
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;
    let metrics = PrometheusBuilder::new().install_recorder().context("error installing metrics recorder")?;

    tracing::info!(
        client_port = %cfg.client_port,
        metrics_port = %cfg.metrics_port,
        work_dir = %cfg.work_dir,
        docker_bin = %cfg.docker_bin,
        submit_failure_policy = ?cfg.submit_failure_policy,
        "starting Knot",
    );
    match App::new(cfg, metrics).await {
        Ok(app) => {
            if let Err(err) = app.spawn().await.context("error joining app task").and_then(|res| res) {
                tracing::error!(error = ?err);
            }
        }
        Err(err) if err.downcast_ref::<ShutdownError>().is_some() => tracing::error!(error = ?err, "fatal error during startup"),
        Err(err) => return Err(err),
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
