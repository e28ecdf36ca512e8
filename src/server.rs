//! Client HTTP server.
//!
//! Exposes the session commands along with a per-session server-sent events channel carrying
//! both the session's log lines and its lifecycle events.

mod prom;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, ServerResult};
use crate::models::descriptor::{Descriptor, FieldValues, PluginKind, PluginRegistry};
use crate::runner::ContainerRuntime;
use crate::session::submit::SubmitRequest;
use crate::session::{self, EditRequest, SessionHandle, SessionSnapshot, SessionsMap};

pub use prom::spawn_prom_server;

/// The SSE event name under which log lines are delivered.
pub const EVENT_SCHEMA_LOG: &str = "schemaLog";
/// The SSE event name of the session snapshot which opens every events stream.
pub const EVENT_SNAPSHOT: &str = "snapshot";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// State shared by all request handlers.
#[derive(Clone)]
pub struct ServerState {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The container runtime used by new sessions.
    runtime: Arc<dyn ContainerRuntime>,
    /// A map of all active sessions.
    sessions: SessionsMap,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerState {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn ContainerRuntime>, sessions: SessionsMap, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            runtime,
            sessions,
            shutdown_tx,
        }
    }

    fn session(&self, id: Uuid) -> ServerResult<SessionHandle> {
        self.sessions.load().get(&id).cloned().ok_or(AppError::UnknownSession)
    }
}

/// Application server.
pub struct AppServer {
    state: ServerState,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(state: ServerState) -> Self {
        Self { state }
    }

    /// Bind the client listener & spawn the server.
    pub async fn spawn(self) -> Result<JoinHandle<()>> {
        let port = self.state.config.client_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await.context("error binding client listener")?;
        let (shutdown, mut shutdown_rx) = (self.state.shutdown_tx.clone(), self.state.shutdown_tx.subscribe());
        let app = router(self.state);
        tracing::info!("client server is listening at 0.0.0.0:{}", port);
        Ok(tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _res = shutdown_rx.recv().await;
                })
                .await;
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from client HTTP server");
            }
            let _res = shutdown.send(());
        }))
    }
}

/// Build the client router over the given state.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/targets", get(list_targets))
        .route("/taps", get(list_taps))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/target/install", post(install_target))
        .route("/sessions/:id/tap", post(select_tap))
        .route("/sessions/:id/catalog/edit", post(edit_catalog))
        .route("/sessions/:id/target", post(submit))
        .route("/sessions/:id/reconfigure", post(reconfigure))
        .route("/sessions/:id/events", get(events))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// A listing of available plugins, along with any error encountered while reading the list.
#[derive(Debug, Serialize)]
struct PluginListing {
    #[serde(skip_serializing_if = "Option::is_none")]
    targets: Option<Vec<Descriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    taps: Option<Vec<Descriptor>>,
    error: Option<String>,
}

async fn list_plugins(config: &Config, kind: PluginKind) -> PluginListing {
    let (plugins, error) = match PluginRegistry::load(config.plugins_path.as_deref()).await {
        Ok(registry) => (registry.of_kind(kind).to_vec(), None),
        Err(err) => {
            tracing::warn!(error = ?err, "error loading plugin list");
            (Vec::new(), Some(format!("{:#}", err)))
        }
    };
    match kind {
        PluginKind::Target => PluginListing { targets: Some(plugins), taps: None, error },
        PluginKind::Tap => PluginListing { targets: None, taps: Some(plugins), error },
    }
}

async fn list_targets(State(state): State<ServerState>) -> Json<PluginListing> {
    Json(list_plugins(&state.config, PluginKind::Target).await)
}

async fn list_taps(State(state): State<ServerState>) -> Json<PluginListing> {
    Json(list_plugins(&state.config, PluginKind::Tap).await)
}

#[derive(Debug, Serialize)]
struct SessionCreated {
    session_id: Uuid,
}

async fn create_session(State(state): State<ServerState>) -> ServerResult<(StatusCode, Json<SessionCreated>)> {
    let handle = session::spawn_session(state.config.clone(), state.runtime.clone(), &state.sessions, &state.shutdown_tx)
        .await
        .map_err(AppError::from_anyhow)?;
    tracing::info!(session = %handle.id, "session created");
    Ok((StatusCode::CREATED, Json(SessionCreated { session_id: handle.id })))
}

async fn get_session(State(state): State<ServerState>, Path(id): Path<Uuid>) -> ServerResult<Json<SessionSnapshot>> {
    Ok(Json(state.session(id)?.snapshot().await?))
}

async fn delete_session(State(state): State<ServerState>, Path(id): Path<Uuid>) -> ServerResult<StatusCode> {
    session::close_session(&state.sessions, id).await?;
    tracing::info!(session = %id, "session closed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct InstallRequest {
    descriptor: Descriptor,
}

#[derive(Debug, Serialize)]
struct InstallResponse {
    error: Option<String>,
}

/// Install a session's target, answering once the install has finished.
///
/// The outcome of the install itself is always reported in the body.
async fn install_target(State(state): State<ServerState>, Path(id): Path<Uuid>, Json(req): Json<InstallRequest>) -> ServerResult<Json<InstallResponse>> {
    let handle = state.session(id)?;
    let error = handle.select_target(req.descriptor).await.err().map(|err| err.to_string());
    Ok(Json(InstallResponse { error }))
}

#[derive(Debug, Deserialize)]
struct SelectTapRequest {
    descriptor: Descriptor,
    #[serde(default)]
    config: FieldValues,
}

async fn select_tap(State(state): State<ServerState>, Path(id): Path<Uuid>, Json(req): Json<SelectTapRequest>) -> ServerResult<StatusCode> {
    state.session(id)?.select_tap(req.descriptor, req.config).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn edit_catalog(State(state): State<ServerState>, Path(id): Path<Uuid>, Json(req): Json<EditRequest>) -> ServerResult<StatusCode> {
    state.session(id)?.edit_field(req).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit(State(state): State<ServerState>, Path(id): Path<Uuid>, Json(req): Json<SubmitRequest>) -> ServerResult<StatusCode> {
    state.session(id)?.submit(req).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn reconfigure(State(state): State<ServerState>, Path(id): Path<Uuid>) -> ServerResult<StatusCode> {
    state.session(id)?.reconfigure().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    from: Option<u64>,
}

/// Stream a session's log lines & lifecycle events.
///
/// Log lines are replayed from the `from` sequence number when given. Lifecycle events are not
/// replayed; instead the stream opens with a snapshot of the session, taken after subscribing,
/// so late joiners start from the current state & catalog.
async fn events(
    State(state): State<ServerState>, Path(id): Path<Uuid>, Query(query): Query<EventsQuery>,
) -> ServerResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let handle = state.session(id)?;
    let events_rx = handle.subscribe_events();
    let snapshot = Event::default()
        .event(EVENT_SNAPSHOT)
        .json_data(handle.snapshot().await?)
        .map_err(|err| AppError::Ise(anyhow::Error::from(err)))?;
    let lifecycle = BroadcastStream::new(events_rx).filter_map(move |res| async move {
        match res {
            Ok(event) => Event::default()
                .event(event.name())
                .json_data(&event)
                .map_err(|err| tracing::error!(error = ?err, "error encoding lifecycle event"))
                .ok(),
            Err(err) => {
                tracing::warn!(session = %id, error = %err, "events subscriber lagged");
                None
            }
        }
    });
    let logs = handle.subscribe_logs(query.from).await?.filter_map(|line| async move {
        Event::default()
            .event(EVENT_SCHEMA_LOG)
            .id(line.sequence.to_string())
            .json_data(&line)
            .map_err(|err| tracing::error!(error = ?err, "error encoding log line"))
            .ok()
    });

    let mut shutdown = state.shutdown_tx.subscribe();
    let stream = stream::once(async move { snapshot })
        .chain(stream::select(logs, lifecycle))
        .map(Ok::<_, Infallible>)
        .take_until(async move {
            let _res = shutdown.recv().await;
        });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping")))
}
