//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The default port used for client traffic; the desktop UI expects the backend here.
pub const DEFAULT_CLIENT_PORT: u16 = 4321;
/// The default port used for serving Prometheus metrics.
pub const DEFAULT_METRICS_PORT: u16 = 4322;
/// The default root directory under which per-session work directories are created.
pub const DEFAULT_WORK_DIR: &str = "/usr/local/knot/sessions";
/// The default container runtime binary.
pub const DEFAULT_DOCKER_BIN: &str = "docker";
/// The default number of seconds a discovery process may stay silent before it is considered stalled.
pub const DEFAULT_DISCOVERY_TIMEOUT_SECONDS: u64 = 300;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The port which client network traffic is to use.
    #[serde(default = "Config::default_client_port")]
    pub client_port: u16,
    /// The port on which Prometheus metrics are served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The root directory under which each session gets its own work directory.
    ///
    /// Session work directories are mounted into tap/target containers, so this path must be
    /// shared with the container runtime.
    #[serde(default = "Config::default_work_dir")]
    pub work_dir: String,
    /// The container runtime binary used to install and run taps & targets.
    #[serde(default = "Config::default_docker_bin")]
    pub docker_bin: String,
    /// An optional path to a JSON file listing the available taps & targets.
    ///
    /// When not set, the built-in plugin list is used.
    #[serde(default)]
    pub plugins_path: Option<String>,

    /// The number of seconds a discovery process may go without output before being killed.
    #[serde(default = "Config::default_discovery_timeout_seconds")]
    pub discovery_timeout_seconds: u64,
    /// How a failed target configuration step is reported.
    #[serde(default)]
    pub submit_failure_policy: SubmitFailurePolicy,
}

/// The policy applied when the final target configuration step fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitFailurePolicy {
    /// Emit a `configureFailed` lifecycle event to observers.
    #[default]
    Surface,
    /// Only record the failure in the server logs.
    LogOnly,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        if config.discovery_timeout_seconds == 0 {
            anyhow::bail!("DISCOVERY_TIMEOUT_SECONDS must be greater than 0");
        }
        Ok(config)
    }

    /// The idle interval after which a silent discovery process is treated as stalled.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_seconds)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_client_port() -> u16 {
        DEFAULT_CLIENT_PORT
    }

    fn default_metrics_port() -> u16 {
        DEFAULT_METRICS_PORT
    }

    fn default_work_dir() -> String {
        DEFAULT_WORK_DIR.into()
    }

    fn default_docker_bin() -> String {
        DEFAULT_DOCKER_BIN.into()
    }

    fn default_discovery_timeout_seconds() -> u64 {
        DEFAULT_DISCOVERY_TIMEOUT_SECONDS
    }
}

#[cfg(test)]
impl Config {
    /// Build a config for tests, rooted in a fresh temporary work directory.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            client_port: DEFAULT_CLIENT_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            work_dir: tmpdir.path().to_string_lossy().to_string(),
            docker_bin: DEFAULT_DOCKER_BIN.into(),
            plugins_path: None,
            discovery_timeout_seconds: 5,
            submit_failure_policy: SubmitFailurePolicy::Surface,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
