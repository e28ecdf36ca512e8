use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Spawns a prometheus server which renders the metrics of the given recorder handle.
pub async fn spawn_prom_server(config: &Config, handle: PrometheusHandle, mut shutdown: broadcast::Receiver<()>) -> Result<JoinHandle<Result<()>>> {
    let app = Router::new().route("/metrics", get(prometheus_scrape)).with_state(handle);
    let listener = TcpListener::bind(("0.0.0.0", config.metrics_port))
        .await
        .context("error binding metrics listener")?;
    tracing::info!("metrics server is listening at 0.0.0.0:{}/metrics", config.metrics_port);
    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _res = shutdown.recv().await;
            })
            .await
            .context("error from metrics server")
    }))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(State(handle): State<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}
