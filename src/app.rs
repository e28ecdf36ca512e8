use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};
use crate::runner::{ContainerRuntime, DockerRuntime};
use crate::server::{spawn_prom_server, AppServer, ServerState};
use crate::session::SessionsMap;

/// The application object for when Knot is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// A map of all active sessions.
    sessions: SessionsMap,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the client HTTP server.
    client_server: JoinHandle<()>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        prepare_work_dir(&config).await?;
        let (shutdown_tx, _) = broadcast::channel(10);
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(config.docker_bin.clone()));
        let sessions = SessionsMap::default();

        let state = ServerState::new(config.clone(), runtime, sessions.clone(), shutdown_tx.clone());
        let client_server = AppServer::new(state).spawn().await.context("error setting up client HTTP server")?;
        let metrics_server = spawn_prom_server(&config, metrics, shutdown_tx.subscribe())
            .await
            .context("error setting up metrics server")?;

        Ok(Self {
            _config: config,
            sessions,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            client_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Knot is shutting down");
        if let Err(err) = self.client_server.await {
            tracing::error!(error = ?err, "error joining client HTTP server task");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        // Sessions stop on the shutdown signal; wait for each to finish killing its processes.
        let sessions = self.sessions.load_full();
        for handle in sessions.values() {
            let _res = handle.close().await;
        }
        tracing::debug!(sessions = sessions.len(), "Knot shutdown");
        Ok(())
    }
}

/// Ensure the root work directory exists, as every session's work directory lives beneath it.
async fn prepare_work_dir(config: &Config) -> ShutdownResult<()> {
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("error creating work dir {}", config.work_dir))
        .map_err(ShutdownError::from)
}
