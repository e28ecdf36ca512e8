//! Tap & target process runner.
//!
//! Every tap and target runs as an isolated child process built by a `ContainerRuntime`. The
//! runner merges the process's stdout & stderr into a single line sequence, publishes each
//! line to the session log as it arrives, and reports a terminal outcome once the process has
//! exited and all of its output has been published.


use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::{FutureExt, Shared};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::logs::LogBroadcaster;
use crate::models::descriptor::{Descriptor, PluginKind};

/// The number of trailing output lines kept for diagnostics.
pub const DIAGNOSTIC_TAIL_LINES: usize = 50;
/// The path at which the session work directory is mounted inside of containers.
pub const CONTAINER_WORK_DIR: &str = "/knot";
/// The name of the tap config file within a session work directory.
pub const TAP_CONFIG_FILE: &str = "tap_config.json";
/// The name of the target config file within a session work directory.
pub const TARGET_CONFIG_FILE: &str = "target_config.json";
/// The name of the edited catalog file within a session work directory.
pub const CATALOG_FILE: &str = "catalog.json";

/// How long output is still drained after a process exits, as orphaned children may hold its pipes.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// How long a runtime's container teardown may take before the container is reported as leaked.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Output markers emitted by container runtimes when a bind mount is refused.
const FS_DENIAL_MARKERS: &[&str] = &["mounts denied", "is not shared from", "file sharing", "permission denied while trying to connect"];

const METRIC_PROCESSES_SPAWNED: &str = "knot_processes_spawned_total";
const METRIC_PROCESS_FAILURES: &str = "knot_process_failures_total";

/// The mode in which a plugin process is run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Fetch the plugin's image.
    Install,
    /// Run a tap in discovery mode, emitting its catalog on stdout.
    Discover,
    /// Run a target against its config and the edited catalog.
    Configure,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Discover => "discover",
            Self::Configure => "configure",
        }
    }
}

/// A runtime which knows how to build the command for running a plugin in a given mode.
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Build the command for running the given plugin.
    ///
    /// The session work directory given is shared with the process, and holds any config and
    /// catalog files which the process is to consume.
    fn command(&self, process_id: Uuid, kind: PluginKind, descriptor: &Descriptor, mode: &RunMode, workdir: &Path) -> Command;

    /// Build the command which tears down whatever the given process started.
    ///
    /// Killing the runtime's client process does not necessarily stop the work it started, as
    /// with a container run through a CLI. Runtimes return a command here when that is the case.
    fn teardown_command(&self, process_id: Uuid, mode: &RunMode) -> Option<Command>;
}

/// A container runtime driving the `docker` CLI.
pub struct DockerRuntime {
    docker_bin: String,
}

impl DockerRuntime {
    pub fn new(docker_bin: String) -> Self {
        Self { docker_bin }
    }

    /// The name given to the container of the given process.
    pub fn container_name(process_id: Uuid) -> String {
        format!("knot-{}", process_id)
    }
}

impl ContainerRuntime for DockerRuntime {
    fn command(&self, process_id: Uuid, _kind: PluginKind, descriptor: &Descriptor, mode: &RunMode, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        let mount = format!("{}:{}", workdir.display(), CONTAINER_WORK_DIR);
        let name = Self::container_name(process_id);
        let in_container = |file: &str| format!("{}/{}", CONTAINER_WORK_DIR, file);
        match mode {
            RunMode::Install => {
                cmd.arg("pull").arg(&descriptor.image);
            }
            RunMode::Discover => {
                cmd.args(["run", "--rm", "--name"])
                    .arg(&name)
                    .arg("-v")
                    .arg(&mount)
                    .arg(&descriptor.image)
                    .arg("--config")
                    .arg(in_container(TAP_CONFIG_FILE))
                    .arg("--discover");
            }
            RunMode::Configure => {
                cmd.args(["run", "--rm", "--name"])
                    .arg(&name)
                    .arg("-v")
                    .arg(&mount)
                    .arg(&descriptor.image)
                    .arg("--config")
                    .arg(in_container(TARGET_CONFIG_FILE))
                    .arg("--catalog")
                    .arg(in_container(CATALOG_FILE));
            }
        }
        cmd
    }

    fn teardown_command(&self, process_id: Uuid, mode: &RunMode) -> Option<Command> {
        match mode {
            // A pull runs entirely within the CLI process.
            RunMode::Install => None,
            RunMode::Discover | RunMode::Configure => {
                let mut cmd = Command::new(&self.docker_bin);
                cmd.args(["rm", "--force"]).arg(Self::container_name(process_id));
                Some(cmd)
            }
        }
    }
}

/// The terminal outcome of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    NonZeroExit(i32),
    /// The process was terminated by a signal, if known.
    Crashed(Option<i32>),
    /// The process produced no output and did not exit within its idle interval.
    TimedOut,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self::Success,
            Some(code) => Self::NonZeroExit(code),
            None => {
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;
                Self::Crashed(signal)
            }
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("exited successfully"),
            Self::NonZeroExit(code) => write!(f, "exited with status {}", code),
            Self::Crashed(Some(signal)) => write!(f, "terminated by signal {}", signal),
            Self::Crashed(None) => f.write_str("terminated abnormally"),
            Self::TimedOut => f.write_str("timed out without output"),
        }
    }
}

/// The final report of a process.
#[derive(Clone, Debug)]
pub struct ProcessReport {
    pub process_id: Uuid,
    pub kind: PluginKind,
    pub outcome: ExitOutcome,
    /// All lines written to stdout.
    pub stdout: String,
    /// The trailing lines of combined output.
    pub tail: Vec<String>,
    /// Whether the process was explicitly killed.
    pub killed: bool,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.outcome == ExitOutcome::Success
    }

    /// A diagnostic describing the outcome along with the trailing lines of output.
    pub fn diagnostic(&self) -> String {
        if self.tail.is_empty() {
            return format!("{} {}", self.kind, self.outcome);
        }
        format!("{} {}:\n{}", self.kind, self.outcome, self.tail.join("\n"))
    }

    /// Whether the process output indicates that the container runtime refused to share the work directory.
    pub fn is_filesystem_denied(&self) -> bool {
        self.tail.iter().any(|line| {
            let line = line.to_lowercase();
            FS_DENIAL_MARKERS.iter().any(|marker| line.contains(marker))
        })
    }
}

/// A handle to a running process.
#[derive(Clone)]
pub struct ProcessHandle {
    pub id: Uuid,
    pub kind: PluginKind,
    kill_tx: Arc<watch::Sender<bool>>,
    report: Shared<oneshot::Receiver<ProcessReport>>,
}

impl ProcessHandle {
    /// Kill the process.
    ///
    /// This is idempotent, and a no-op for a process which has already exited.
    pub fn kill(&self) {
        let _res = self.kill_tx.send(true);
    }

    /// Await the process's final report.
    pub async fn wait(&self) -> Result<ProcessReport> {
        self.report.clone().await.map_err(|_| anyhow!("process supervisor terminated without a report"))
    }
}

/// A runner of plugin processes, publishing their output to a session log.
#[derive(Clone)]
pub struct ProcessRunner {
    runtime: Arc<dyn ContainerRuntime>,
    logs: LogBroadcaster,
}

impl ProcessRunner {
    /// Create a new instance.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, logs: LogBroadcaster) -> Self {
        metrics::describe_counter!(METRIC_PROCESSES_SPAWNED, metrics::Unit::Count, "the number of tap & target processes spawned");
        metrics::describe_counter!(METRIC_PROCESS_FAILURES, metrics::Unit::Count, "the number of tap & target processes which did not exit successfully");
        Self { runtime, logs }
    }

    /// Start the given plugin in the given mode.
    ///
    /// With an `idle_timeout`, the process is killed & reported as timed out once it has gone
    /// that long without producing output.
    #[tracing::instrument(level = "debug", skip(self, descriptor, workdir), fields(plugin = %descriptor.name))]
    pub fn start(&self, kind: PluginKind, descriptor: &Descriptor, mode: RunMode, workdir: &Path, idle_timeout: Option<Duration>) -> Result<ProcessHandle> {
        let id = Uuid::new_v4();
        let mut cmd = self.runtime.command(id, kind, descriptor, &mode, workdir);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::PermissionDenied => AppError::FilesystemAccessDenied(format!("{} {}: {}", kind, descriptor.name, err)),
            _ => AppError::SpawnFailed(format!("{} {}: {}", kind, descriptor.name, err)),
        })?;
        metrics::counter!(METRIC_PROCESSES_SPAWNED, "kind" => kind.as_str(), "mode" => mode.as_str()).increment(1);

        tracing::debug!(process = %id, pid = ?child.id(), "process started");
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, Pipe::Stdout, lines_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, Pipe::Stderr, lines_tx)));
        }

        let (kill_tx, kill_rx) = watch::channel(false);
        let (report_tx, report_rx) = oneshot::channel();
        let supervisor = Supervisor {
            id,
            kind,
            mode,
            child,
            runtime: self.runtime.clone(),
            lines_rx,
            kill_rx,
            idle_timeout,
            logs: self.logs.clone(),
            workdir: workdir.to_path_buf(),
        };
        tokio::spawn(async move {
            let report = supervisor.run().await;
            for reader in readers {
                reader.abort();
            }
            let _res = report_tx.send(report);
        });

        Ok(ProcessHandle {
            id,
            kind,
            kill_tx: Arc::new(kill_tx),
            report: report_rx.shared(),
        })
    }
}

#[derive(Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

async fn read_lines<R: AsyncRead + Unpin>(pipe: R, source: Pipe, tx: mpsc::UnboundedSender<(Pipe, String)>) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((source, line)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = ?err, "error reading process output");
                return;
            }
        }
    }
}

/// The task which owns a child process until it has exited and its output has been drained.
struct Supervisor {
    id: Uuid,
    kind: PluginKind,
    mode: RunMode,
    child: Child,
    runtime: Arc<dyn ContainerRuntime>,
    lines_rx: mpsc::UnboundedReceiver<(Pipe, String)>,
    kill_rx: watch::Receiver<bool>,
    idle_timeout: Option<Duration>,
    logs: LogBroadcaster,
    workdir: PathBuf,
}

impl Supervisor {
    async fn run(mut self) -> ProcessReport {
        let far_future = Duration::from_secs(60 * 60 * 24 * 365);
        let idle = tokio::time::sleep(self.idle_timeout.unwrap_or(far_future));
        let drain = tokio::time::sleep(far_future);
        tokio::pin!(idle, drain);

        let (mut stdout, mut tail) = (String::new(), std::collections::VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES));
        let (mut status, mut lines_open, mut kill_open) = (None, true, true);
        let (mut killed, mut timed_out) = (false, false);
        let mut teardown_task = None;
        while status.is_none() || lines_open {
            tokio::select! {
                line = self.lines_rx.recv(), if lines_open => match line {
                    Some((pipe, text)) => {
                        if let Pipe::Stdout = pipe {
                            stdout.push_str(&text);
                            stdout.push('\n');
                        }
                        if tail.len() == DIAGNOSTIC_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(text.clone());
                        self.logs.publish(self.kind, text);
                        if let Some(timeout) = self.idle_timeout {
                            idle.as_mut().reset(Instant::now() + timeout);
                        }
                    }
                    None => lines_open = false,
                },
                res = self.child.wait(), if status.is_none() => {
                    drain.as_mut().reset(Instant::now() + DRAIN_GRACE);
                    status = Some(res);
                }
                res = self.kill_rx.changed(), if kill_open && !killed => match res {
                    Ok(()) if *self.kill_rx.borrow() => {
                        tracing::debug!(process = %self.id, "killing process");
                        killed = true;
                        if status.is_none() {
                            let _res = self.child.start_kill();
                            teardown_task = teardown_task.or_else(|| self.spawn_teardown());
                        }
                    }
                    Ok(()) => (),
                    Err(_) => kill_open = false,
                },
                _ = &mut idle, if self.idle_timeout.is_some() && status.is_none() && !timed_out => {
                    tracing::warn!(process = %self.id, workdir = ?self.workdir, "process went idle, killing");
                    timed_out = true;
                    let _res = self.child.start_kill();
                    teardown_task = teardown_task.or_else(|| self.spawn_teardown());
                }
                _ = &mut drain, if status.is_some() && lines_open => {
                    tracing::debug!(process = %self.id, "process output still open after exit, abandoning");
                    lines_open = false;
                }
            }
        }

        if let Some(task) = teardown_task {
            if let Err(err) = task.await {
                tracing::error!(process = %self.id, error = ?err, "error joining process teardown");
            }
        }

        let outcome = match status {
            _ if timed_out => ExitOutcome::TimedOut,
            Some(Ok(status)) => ExitOutcome::from_status(status),
            Some(Err(err)) => {
                tracing::error!(process = %self.id, error = ?err, "error awaiting process exit");
                ExitOutcome::Crashed(None)
            }
            None => ExitOutcome::Crashed(None),
        };
        if outcome != ExitOutcome::Success {
            metrics::counter!(METRIC_PROCESS_FAILURES, "kind" => self.kind.as_str()).increment(1);
        }
        tracing::debug!(process = %self.id, %outcome, killed, "process finished");
        ProcessReport {
            process_id: self.id,
            kind: self.kind,
            outcome,
            stdout,
            tail: tail.into_iter().collect(),
            killed,
        }
    }

    /// Spawn the runtime's teardown of this process, if it has one.
    fn spawn_teardown(&self) -> Option<JoinHandle<()>> {
        let cmd = self.runtime.teardown_command(self.id, &self.mode)?;
        Some(tokio::spawn(teardown(self.id, cmd)))
    }
}

/// Run a teardown command, reporting the process's work as leaked if it does not succeed in time.
async fn teardown(process_id: Uuid, mut cmd: Command) {
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped()).kill_on_drop(true);
    match tokio::time::timeout(TEARDOWN_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => tracing::debug!(process = %process_id, "process teardown finished"),
        Ok(Ok(output)) => tracing::error!(
            process = %process_id,
            status = ?output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "process teardown failed, its container may have leaked"
        ),
        Ok(Err(err)) => tracing::error!(process = %process_id, error = ?err, "error running process teardown, its container may have leaked"),
        Err(_) => tracing::error!(process = %process_id, "process teardown timed out, its container may have leaked"),
    }
}
