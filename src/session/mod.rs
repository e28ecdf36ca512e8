//! Session lifecycle controller.
//!
//! A session drives a single pipeline setup from target selection through to the final target
//! configuration step. Every command and every process exit is funneled through the session's
//! request channel, so all transitions of a session are serialized on its controller task.
//!
//! Process exits re-enter the controller tagged with the ID of the process which exited. An exit
//! from any process other than the one currently in flight is stale (the process was killed by
//! a reconfiguration) and is ignored.

#[cfg(test)]
mod mod_test;
pub mod submit;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use uuid::Uuid;

use crate::config::{Config, SubmitFailurePolicy};
use crate::error::{AppError, ServerResult};
use crate::logs::{LogBroadcaster, LogCtl, LogSubscription};
use crate::models::catalog::{Catalog, MetadataLocator};
use crate::models::descriptor::{Descriptor, FieldValues, PluginKind};
use crate::models::lifecycle::{DiscoveryError, LifecycleEvent, LifecycleState};
use crate::runner::{ContainerRuntime, ExitOutcome, ProcessHandle, ProcessReport, ProcessRunner, RunMode, TAP_CONFIG_FILE};
use crate::session::submit::{Submission, SubmitRequest};

/// How long a killed process is given to terminate before it is considered leaked.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);
const EVENTS_CAPACITY: usize = 1024;
const REQUESTS_CAPACITY: usize = 100;

const METRIC_SESSIONS_ACTIVE: &str = "knot_sessions_active";
const METRIC_TRANSITIONS: &str = "knot_session_transitions_total";

/// A map of all active sessions.
pub type SessionsMap = Arc<ArcSwap<HashMap<Uuid, SessionHandle>>>;

/// A message bound for a session controller.
pub enum SessionCtlMsg {
    /// Select & install the session's target, answering once the install has finished.
    SelectTarget {
        descriptor: Descriptor,
        tx: oneshot::Sender<ServerResult<()>>,
    },
    /// Select the session's tap, discovering its catalog as soon as the target is installed.
    SelectTap {
        descriptor: Descriptor,
        config: FieldValues,
        tx: oneshot::Sender<ServerResult<()>>,
    },
    /// Edit a single field of the discovered catalog.
    EditField {
        request: EditRequest,
        tx: oneshot::Sender<ServerResult<()>>,
    },
    /// Submit the edited catalog & target config, starting the configuration step.
    Submit {
        request: SubmitRequest,
        tx: oneshot::Sender<ServerResult<()>>,
    },
    /// Abandon all progress, returning the session to idle.
    Reconfigure { tx: oneshot::Sender<ServerResult<()>> },
    /// Query the session's current state.
    Snapshot { tx: oneshot::Sender<ServerResult<SessionSnapshot>> },
    /// Tear down the session.
    Close { tx: oneshot::Sender<ServerResult<()>> },
    /// A process started by this session has exited.
    ProcessExited { process_id: Uuid, report: Result<ProcessReport> },
}

/// A request to edit a single field of a catalog's metadata.
///
/// The metadata entry is located by breadcrumb or by index; when neither is given the stream's
/// root entry is used.
#[derive(Clone, Debug, Deserialize)]
pub struct EditRequest {
    pub stream_id: String,
    #[serde(default)]
    pub breadcrumb: Option<Vec<String>>,
    #[serde(default)]
    pub index: Option<usize>,
    pub field: String,
    pub value: Value,
}

impl EditRequest {
    pub fn locator(&self) -> ServerResult<MetadataLocator> {
        match (&self.breadcrumb, self.index) {
            (Some(_), Some(_)) => Err(AppError::InvalidInput("only one of breadcrumb or index may be given".into())),
            (Some(breadcrumb), None) => Ok(MetadataLocator::Breadcrumb(breadcrumb.clone())),
            (None, Some(index)) => Ok(MetadataLocator::Index(index)),
            (None, None) => Ok(MetadataLocator::root()),
        }
    }
}

/// A point-in-time view of a session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: LifecycleState,
    pub target: Option<String>,
    pub tap: Option<String>,
    pub catalog: Option<Catalog>,
}

/// A handle to a session controller.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    tx: mpsc::Sender<SessionCtlMsg>,
    state: watch::Receiver<LifecycleState>,
    events: broadcast::Sender<LifecycleEvent>,
    logs: LogBroadcaster,
}

impl SessionHandle {
    async fn request<T>(&self, msg: impl FnOnce(oneshot::Sender<ServerResult<T>>) -> SessionCtlMsg) -> ServerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(msg(tx)).await.map_err(|_| AppError::UnknownSession)?;
        rx.await.map_err(|_| AppError::UnknownSession)?
    }

    /// Select & install the given target, resolving once the install has finished.
    pub async fn select_target(&self, descriptor: Descriptor) -> ServerResult<()> {
        self.request(|tx| SessionCtlMsg::SelectTarget { descriptor, tx }).await
    }

    pub async fn select_tap(&self, descriptor: Descriptor, config: FieldValues) -> ServerResult<()> {
        self.request(|tx| SessionCtlMsg::SelectTap { descriptor, config, tx }).await
    }

    pub async fn edit_field(&self, request: EditRequest) -> ServerResult<()> {
        self.request(|tx| SessionCtlMsg::EditField { request, tx }).await
    }

    /// Submit the session, resolving once the configuration step has been started.
    pub async fn submit(&self, request: SubmitRequest) -> ServerResult<()> {
        self.request(|tx| SessionCtlMsg::Submit { request, tx }).await
    }

    pub async fn reconfigure(&self) -> ServerResult<()> {
        self.request(|tx| SessionCtlMsg::Reconfigure { tx }).await
    }

    pub async fn snapshot(&self) -> ServerResult<SessionSnapshot> {
        self.request(|tx| SessionCtlMsg::Snapshot { tx }).await
    }

    /// Tear down the session, killing any running process.
    pub async fn close(&self) -> ServerResult<()> {
        self.request(|tx| SessionCtlMsg::Close { tx }).await
    }

    /// The session's current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// A watch over the session's lifecycle state.
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    /// Subscribe to all lifecycle events emitted from this point forward.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the session's log, optionally replaying from the given sequence number.
    pub async fn subscribe_logs(&self, from: Option<u64>) -> ServerResult<LogSubscription> {
        self.logs.subscribe(from).await.map_err(AppError::Ise)
    }
}

/// The process currently running on behalf of a session.
struct InFlight {
    mode: RunMode,
    /// The descriptor name & image of the running plugin.
    key: (String, String),
    handle: ProcessHandle,
}

/// The tap selected for a session.
struct TapSelection {
    descriptor: Descriptor,
    config: FieldValues,
}

/// A controller driving the lifecycle of a single session.
pub struct SessionCtl {
    /// The ID of this session.
    id: Uuid,
    /// The application's runtime config.
    config: Arc<Config>,
    /// The directory shared with this session's processes.
    workdir: PathBuf,
    /// The runner used for starting this session's processes.
    runner: ProcessRunner,

    /// A channel of inbound requests, weak so that the session ends once all handles are dropped.
    requests_tx: mpsc::WeakSender<SessionCtlMsg>,
    /// A channel of inbound requests.
    requests_rx: ReceiverStream<SessionCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The session's current lifecycle state.
    state: watch::Sender<LifecycleState>,
    /// The channel of lifecycle events.
    events: broadcast::Sender<LifecycleEvent>,

    /// The process currently running, if any.
    in_flight: Option<InFlight>,
    /// Callers awaiting the outcome of the target install.
    install_waiters: Vec<oneshot::Sender<ServerResult<()>>>,
    target: Option<Descriptor>,
    tap: Option<TapSelection>,
    catalog: Option<Catalog>,
}

impl SessionCtl {
    /// Create a new instance, along with the session's work directory.
    pub async fn new(config: Arc<Config>, runtime: Arc<dyn ContainerRuntime>, shutdown_tx: &broadcast::Sender<()>) -> Result<(Self, SessionHandle)> {
        let id = Uuid::new_v4();
        let workdir = PathBuf::from(&config.work_dir).join(id.to_string());
        tokio::fs::create_dir_all(&workdir).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::PermissionDenied => anyhow::Error::from(AppError::FilesystemAccessDenied(format!("{}: {}", workdir.display(), err))),
            _ => anyhow::Error::from(err).context(format!("error creating session work dir {}", workdir.display())),
        })?;
        metrics::describe_gauge!(METRIC_SESSIONS_ACTIVE, metrics::Unit::Count, "the number of active sessions");
        metrics::describe_counter!(METRIC_TRANSITIONS, metrics::Unit::Count, "the number of session lifecycle transitions");

        // The log controller outlives this controller until every log subscriber has gone away.
        let (log_ctl, logs) = LogCtl::new(id);
        let _log_handle = log_ctl.spawn();
        let (requests_tx, requests_rx) = mpsc::channel(REQUESTS_CAPACITY);
        let (state, state_rx) = watch::channel(LifecycleState::Idle);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let handle = SessionHandle {
            id,
            tx: requests_tx.clone(),
            state: state_rx,
            events: events.clone(),
            logs: logs.clone(),
        };
        Ok((
            Self {
                id,
                config,
                workdir,
                runner: ProcessRunner::new(runtime, logs),
                requests_tx: requests_tx.downgrade(),
                requests_rx: ReceiverStream::new(requests_rx),
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                state,
                events,
                in_flight: None,
                install_waiters: Vec::new(),
                target: None,
                tap: None,
                catalog: None,
            },
            handle,
        ))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(session = %self.id, workdir = ?self.workdir, "session controller has started");
        metrics::gauge!(METRIC_SESSIONS_ACTIVE).increment(1.0);
        let mut close_tx = None;
        loop {
            tokio::select! {
                msg_opt = self.requests_rx.next() => match msg_opt {
                    Some(SessionCtlMsg::Close { tx }) => {
                        close_tx = Some(tx);
                        break;
                    }
                    Some(msg) => self.handle_ctl_msg(msg).await,
                    None => break,
                },
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        self.stop_in_flight().await;
        self.cancel_install_waiters();
        if let Err(err) = tokio::fs::remove_dir_all(&self.workdir).await {
            tracing::warn!(session = %self.id, error = ?err, "error removing session work dir");
        }
        metrics::gauge!(METRIC_SESSIONS_ACTIVE).decrement(1.0);
        tracing::debug!(session = %self.id, "session controller has shutdown");
        if let Some(tx) = close_tx {
            let _res = tx.send(Ok(()));
        }
    }

    /// Handle a session controller message.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(session = %self.id))]
    async fn handle_ctl_msg(&mut self, msg: SessionCtlMsg) {
        match msg {
            SessionCtlMsg::SelectTarget { descriptor, tx } => self.handle_select_target(descriptor, tx),
            SessionCtlMsg::SelectTap { descriptor, config, tx } => {
                let _res = tx.send(self.handle_select_tap(descriptor, config).await);
            }
            SessionCtlMsg::EditField { request, tx } => {
                let _res = tx.send(self.handle_edit_field(request));
            }
            SessionCtlMsg::Submit { request, tx } => {
                let _res = tx.send(self.handle_submit(request).await);
            }
            SessionCtlMsg::Reconfigure { tx } => {
                self.handle_reconfigure().await;
                let _res = tx.send(Ok(()));
            }
            SessionCtlMsg::Snapshot { tx } => {
                let _res = tx.send(Ok(self.snapshot()));
            }
            SessionCtlMsg::Close { tx } => {
                let _res = tx.send(Ok(()));
            }
            SessionCtlMsg::ProcessExited { process_id, report } => self.handle_process_exited(process_id, report).await,
        }
    }

    /// Handle a request to select & install a target.
    fn handle_select_target(&mut self, descriptor: Descriptor, tx: oneshot::Sender<ServerResult<()>>) {
        if let Err(err) = descriptor.validate() {
            let _res = tx.send(Err(AppError::from_anyhow(err)));
            return;
        }

        // Attach to an in-flight install of the same target.
        let key = (descriptor.name.clone(), descriptor.image.clone());
        if let Some(in_flight) = self.in_flight.as_ref().filter(|in_flight| in_flight.mode == RunMode::Install && in_flight.key == key) {
            tracing::debug!(process = %in_flight.handle.id, target = %descriptor.name, "attaching to in-flight install");
            self.install_waiters.push(tx);
            return;
        }

        let state = self.current_state();
        match state {
            LifecycleState::Idle => (),
            // The target is already in place, nothing to do.
            _ if self.target.as_ref().map(|target| target == &descriptor).unwrap_or(false) && !state.is_error() => {
                let _res = tx.send(Ok(()));
                return;
            }
            _ => {
                let _res = tx.send(Err(AppError::InvalidTransition { state, action: "select a target" }));
                return;
            }
        }

        self.transition(LifecycleState::Selecting);
        self.emit(LifecycleEvent::TargetSelected { target: descriptor.name.clone() });
        match self.runner.start(PluginKind::Target, &descriptor, RunMode::Install, &self.workdir, None) {
            Ok(handle) => {
                self.transition(LifecycleState::Installing);
                self.track(RunMode::Install, key, handle);
                self.target = Some(descriptor);
                self.install_waiters.push(tx);
            }
            Err(err) => {
                let err = AppError::from_anyhow(err);
                tracing::error!(error = %err, "error starting target install");
                self.transition(LifecycleState::InstallFailed);
                self.emit(LifecycleEvent::TargetInstalled {
                    target: descriptor.name.clone(),
                    error: Some(err.to_string()),
                });
                self.target = Some(descriptor);
                let _res = tx.send(Err(err));
            }
        }
    }

    /// Handle a request to select a tap.
    async fn handle_select_tap(&mut self, descriptor: Descriptor, config: FieldValues) -> ServerResult<()> {
        descriptor.validate_values(&config).map_err(AppError::from_anyhow)?;
        let state = self.current_state();
        match state {
            LifecycleState::Idle | LifecycleState::Selecting | LifecycleState::Installing => {
                tracing::debug!(tap = %descriptor.name, "tap recorded, discovery will start once the target is installed");
                self.tap = Some(TapSelection { descriptor, config });
                Ok(())
            }
            LifecycleState::Installed => {
                self.tap = Some(TapSelection { descriptor, config });
                self.start_discovery().await
            }
            _ => Err(AppError::InvalidTransition { state, action: "select a tap" }),
        }
    }

    /// Start the selected tap in discovery mode.
    async fn start_discovery(&mut self) -> ServerResult<()> {
        let tap = match self.tap.as_ref() {
            Some(tap) => tap,
            None => return Err(AppError::InvalidInput("no tap has been selected".into())),
        };
        let (descriptor, config) = (tap.descriptor.clone(), tap.config.clone());
        self.transition(LifecycleState::Discovering);
        self.emit(LifecycleEvent::DiscoveryStarted { tap: descriptor.name.clone() });

        match self.launch_discovery(&descriptor, &config).await {
            Ok(handle) => {
                self.track(RunMode::Discover, (descriptor.name, descriptor.image), handle);
                Ok(())
            }
            Err(err) => {
                let err = AppError::from_anyhow(err);
                let kind = match &err {
                    AppError::FilesystemAccessDenied(_) => DiscoveryError::DockerConfig,
                    _ => DiscoveryError::TapError,
                };
                self.fail_discovery(kind, err.to_string());
                Err(err)
            }
        }
    }

    /// Write the tap's config into the work directory & start the tap in discovery mode.
    async fn launch_discovery(&self, descriptor: &Descriptor, config: &FieldValues) -> Result<ProcessHandle> {
        let config = serde_json::to_value(config).context("error encoding tap config")?;
        submit::write_json(&self.workdir.join(TAP_CONFIG_FILE), &config).await?;
        self.runner
            .start(PluginKind::Tap, descriptor, RunMode::Discover, &self.workdir, Some(self.config.discovery_timeout()))
    }

    /// Handle a request to edit a single catalog field.
    fn handle_edit_field(&mut self, request: EditRequest) -> ServerResult<()> {
        let state = self.current_state();
        let catalog = match (state, self.catalog.as_mut()) {
            (LifecycleState::AwaitingEdits, Some(catalog)) => catalog,
            _ => return Err(AppError::InvalidTransition { state, action: "edit the catalog" }),
        };
        let locator = request.locator()?;
        catalog.set_field(&request.stream_id, &locator, &request.field, request.value)?;
        tracing::debug!(stream = %request.stream_id, %locator, field = %request.field, "catalog edited");
        self.emit(LifecycleEvent::CatalogEdited {
            stream_id: request.stream_id,
            field: request.field,
        });
        Ok(())
    }

    /// Handle a request to submit the session, starting the target's configuration step.
    async fn handle_submit(&mut self, request: SubmitRequest) -> ServerResult<()> {
        let state = self.current_state();
        let (target, tap, catalog) = match (state, &self.target, &self.tap, &self.catalog) {
            (LifecycleState::AwaitingEdits, Some(target), Some(tap), Some(catalog)) => (target.clone(), tap, catalog),
            _ => return Err(AppError::InvalidTransition { state, action: "submit" }),
        };
        let submission = Submission::prepare(request, &target, &tap.config, catalog).map_err(AppError::from_anyhow)?;
        submission.persist(&self.workdir).await.map_err(AppError::from_anyhow)?;
        self.catalog = Some(submission.catalog);

        self.transition(LifecycleState::Submitting);
        self.emit(LifecycleEvent::Submitting { target: target.name.clone() });
        match self.runner.start(PluginKind::Target, &target, RunMode::Configure, &self.workdir, None) {
            Ok(handle) => {
                self.track(RunMode::Configure, (target.name, target.image), handle);
                Ok(())
            }
            Err(err) => {
                let err = AppError::from_anyhow(err);
                self.fail_configure(&target.name, err.to_string());
                Err(err)
            }
        }
    }

    /// Handle a request to reconfigure the session from scratch.
    async fn handle_reconfigure(&mut self) {
        tracing::debug!(state = %self.current_state(), "reconfiguring session");
        self.stop_in_flight().await;
        self.cancel_install_waiters();
        self.target = None;
        self.tap = None;
        self.catalog = None;
        self.transition(LifecycleState::Idle);
        self.emit(LifecycleEvent::Reconfigured);
    }

    /// Handle the exit of a process started by this session.
    async fn handle_process_exited(&mut self, process_id: Uuid, report: Result<ProcessReport>) {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.handle.id == process_id => in_flight,
            other => {
                tracing::debug!(process = %process_id, "ignoring exit of stale process");
                self.in_flight = other;
                return;
            }
        };
        let report = match report {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = ?err, process = %process_id, "error awaiting process report");
                ProcessReport {
                    process_id,
                    kind: in_flight.handle.kind,
                    outcome: ExitOutcome::Crashed(None),
                    stdout: String::new(),
                    tail: vec![err.to_string()],
                    killed: false,
                }
            }
        };
        match in_flight.mode {
            RunMode::Install => self.handle_install_finished(in_flight.key.0, report).await,
            RunMode::Discover => self.handle_discovery_finished(report),
            RunMode::Configure => self.handle_configure_finished(in_flight.key.0, report),
        }
    }

    async fn handle_install_finished(&mut self, target: String, report: ProcessReport) {
        if report.is_success() {
            self.transition(LifecycleState::Installed);
            self.emit(LifecycleEvent::TargetInstalled { target, error: None });
            for tx in self.install_waiters.drain(..) {
                let _res = tx.send(Ok(()));
            }
            if self.tap.is_some() {
                if let Err(err) = self.start_discovery().await {
                    tracing::error!(error = %err, "error starting discovery after install");
                }
            }
            return;
        }

        let diagnostic = report.diagnostic();
        tracing::error!(%target, %diagnostic, "target install failed");
        self.transition(LifecycleState::InstallFailed);
        self.emit(LifecycleEvent::TargetInstalled {
            target,
            error: Some(diagnostic.clone()),
        });
        for tx in self.install_waiters.drain(..) {
            let _res = tx.send(Err(AppError::InstallFailed(diagnostic.clone())));
        }
    }

    fn handle_discovery_finished(&mut self, report: ProcessReport) {
        if !report.is_success() {
            let kind = match report.outcome {
                ExitOutcome::TimedOut => DiscoveryError::Timeout,
                _ if report.is_filesystem_denied() => DiscoveryError::DockerConfig,
                _ => DiscoveryError::TapError,
            };
            let diagnostic = match kind {
                DiscoveryError::Timeout => AppError::DiscoveryTimeout(self.config.discovery_timeout_seconds).to_string(),
                _ => report.diagnostic(),
            };
            self.fail_discovery(kind, diagnostic);
            return;
        }

        match Catalog::parse(&report.stdout) {
            Ok(catalog) => {
                tracing::debug!(streams = catalog.streams.len(), "catalog discovered");
                self.transition(LifecycleState::SchemaReady);
                self.emit(LifecycleEvent::SchemaLoaded { catalog: catalog.clone() });
                self.catalog = Some(catalog);
                self.transition(LifecycleState::AwaitingEdits);
            }
            Err(err) => self.fail_discovery(DiscoveryError::InvalidSchema, AppError::InvalidSchema(err.to_string()).to_string()),
        }
    }

    fn handle_configure_finished(&mut self, target: String, report: ProcessReport) {
        if report.is_success() {
            self.transition(LifecycleState::Configured);
            self.emit(LifecycleEvent::TargetConfigured { target });
            return;
        }
        self.fail_configure(&target, report.diagnostic());
    }

    fn fail_discovery(&mut self, error: DiscoveryError, diagnostic: String) {
        tracing::error!(?error, %diagnostic, "tap discovery failed");
        self.transition(error.state());
        self.emit(LifecycleEvent::DiscoveryFailed { error, diagnostic });
    }

    fn fail_configure(&mut self, target: &str, diagnostic: String) {
        tracing::error!(%target, %diagnostic, "target configuration failed");
        self.transition(LifecycleState::ConfigureFailed);
        match self.config.submit_failure_policy {
            SubmitFailurePolicy::Surface => self.emit(LifecycleEvent::ConfigureFailed {
                target: target.to_string(),
                diagnostic,
            }),
            SubmitFailurePolicy::LogOnly => (),
        }
    }

    /// Track the given process as in flight, feeding its exit back into this controller.
    fn track(&mut self, mode: RunMode, key: (String, String), handle: ProcessHandle) {
        let (requests_tx, watched) = (self.requests_tx.clone(), handle.clone());
        tokio::spawn(async move {
            let report = watched.wait().await;
            if let Some(tx) = requests_tx.upgrade() {
                let _res = tx.send(SessionCtlMsg::ProcessExited { process_id: watched.id, report }).await;
            }
        });
        self.in_flight = Some(InFlight { mode, key, handle });
    }

    /// Kill the in-flight process, if any, awaiting its termination.
    async fn stop_in_flight(&mut self) {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) => in_flight,
            None => return,
        };
        in_flight.handle.kill();
        match tokio::time::timeout(KILL_GRACE_PERIOD, in_flight.handle.wait()).await {
            Ok(Ok(report)) => tracing::debug!(process = %report.process_id, outcome = %report.outcome, "in-flight process stopped"),
            Ok(Err(err)) => tracing::error!(error = ?err, process = %in_flight.handle.id, "error awaiting killed process"),
            Err(_) => tracing::error!(
                process = %in_flight.handle.id,
                mode = in_flight.mode.as_str(),
                "process did not terminate within {:?} of being killed and may have leaked",
                KILL_GRACE_PERIOD
            ),
        }
    }

    fn cancel_install_waiters(&mut self) {
        for tx in self.install_waiters.drain(..) {
            let _res = tx.send(Err(AppError::Cancelled));
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.current_state(),
            target: self.target.as_ref().map(|target| target.name.clone()),
            tap: self.tap.as_ref().map(|tap| tap.descriptor.name.clone()),
            catalog: self.catalog.clone(),
        }
    }

    fn current_state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn transition(&mut self, state: LifecycleState) {
        tracing::debug!(session = %self.id, from = %self.current_state(), to = %state, "session transition");
        metrics::counter!(METRIC_TRANSITIONS, "state" => state.as_str()).increment(1);
        self.state.send_replace(state);
    }

    fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(session = %self.id, event = event.name(), "emitting lifecycle event");
        let _res = self.events.send(event);
    }
}

/// Create & spawn a new session, registering it in the given sessions map.
pub async fn spawn_session(config: Arc<Config>, runtime: Arc<dyn ContainerRuntime>, sessions: &SessionsMap, shutdown_tx: &broadcast::Sender<()>) -> Result<SessionHandle> {
    let (ctl, handle) = SessionCtl::new(config, runtime, shutdown_tx).await.context("error creating session")?;
    let _handle = ctl.spawn();
    sessions.rcu(|sessions| {
        let mut updated = HashMap::clone(sessions);
        updated.insert(handle.id, handle.clone());
        updated
    });
    Ok(handle)
}

/// Remove the given session from the sessions map & tear it down.
pub async fn close_session(sessions: &SessionsMap, id: Uuid) -> ServerResult<()> {
    let handle = sessions.load().get(&id).cloned().ok_or(AppError::UnknownSession)?;
    sessions.rcu(|sessions| {
        let mut updated = HashMap::clone(sessions);
        updated.remove(&id);
        updated
    });
    handle.close().await
}
