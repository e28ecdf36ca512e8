//! Session lifecycle states & events.

use serde::Serialize;

use crate::models::catalog::Catalog;

/// The lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Idle,
    Selecting,
    Installing,
    Installed,
    InstallFailed,
    Discovering,
    SchemaReady,
    AwaitingEdits,
    Submitting,
    Configured,
    ConfigureFailed,
    /// The tap exited unsuccessfully during discovery.
    TapError,
    /// The tap's discovery output was not a valid catalog.
    InvalidSchema,
    /// The container runtime could not access the session's shared directory.
    DockerConfigError,
    /// The tap went silent during discovery and was killed.
    DiscoveryTimeout,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Selecting => "Selecting",
            Self::Installing => "Installing",
            Self::Installed => "Installed",
            Self::InstallFailed => "InstallFailed",
            Self::Discovering => "Discovering",
            Self::SchemaReady => "SchemaReady",
            Self::AwaitingEdits => "AwaitingEdits",
            Self::Submitting => "Submitting",
            Self::Configured => "Configured",
            Self::ConfigureFailed => "ConfigureFailed",
            Self::TapError => "TapError",
            Self::InvalidSchema => "InvalidSchema",
            Self::DockerConfigError => "DockerConfigError",
            Self::DiscoveryTimeout => "DiscoveryTimeout",
        }
    }

    /// Whether this is an error state from which only a reconfigure recovers.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::InstallFailed | Self::ConfigureFailed | Self::TapError | Self::InvalidSchema | Self::DockerConfigError | Self::DiscoveryTimeout
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reason a discovery step failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryError {
    /// The tap exited non-zero or crashed.
    TapError,
    /// The tap's output did not parse into a valid catalog.
    InvalidSchema,
    /// The container runtime could not access the shared session directory.
    DockerConfig,
    /// The tap produced no output and did not exit in time.
    Timeout,
}

impl DiscoveryError {
    /// The lifecycle state a session moves to on this error.
    pub fn state(&self) -> LifecycleState {
        match self {
            Self::TapError => LifecycleState::TapError,
            Self::InvalidSchema => LifecycleState::InvalidSchema,
            Self::DockerConfig => LifecycleState::DockerConfigError,
            Self::Timeout => LifecycleState::DiscoveryTimeout,
        }
    }
}

/// A notification of a lifecycle transition, delivered to session observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    TargetSelected { target: String },
    #[serde(rename_all = "camelCase")]
    TargetInstalled { target: String, error: Option<String> },
    #[serde(rename_all = "camelCase")]
    DiscoveryStarted { tap: String },
    #[serde(rename_all = "camelCase")]
    SchemaLoaded { catalog: Catalog },
    #[serde(rename_all = "camelCase")]
    DiscoveryFailed { error: DiscoveryError, diagnostic: String },
    #[serde(rename_all = "camelCase")]
    CatalogEdited { stream_id: String, field: String },
    #[serde(rename_all = "camelCase")]
    Submitting { target: String },
    #[serde(rename_all = "camelCase")]
    TargetConfigured { target: String },
    #[serde(rename_all = "camelCase")]
    ConfigureFailed { target: String, diagnostic: String },
    Reconfigured,
}

impl LifecycleEvent {
    /// The name under which this event is delivered on the real-time channel.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TargetSelected { .. } => "targetSelected",
            Self::TargetInstalled { .. } => "targetInstalled",
            Self::DiscoveryStarted { .. } => "discoveryStarted",
            Self::SchemaLoaded { .. } => "schemaLoaded",
            Self::DiscoveryFailed { .. } => "discoveryFailed",
            Self::CatalogEdited { .. } => "catalogEdited",
            Self::Submitting { .. } => "submitting",
            Self::TargetConfigured { .. } => "targetConfigured",
            Self::ConfigureFailed { .. } => "configureFailed",
            Self::Reconfigured => "reconfigured",
        }
    }
}
