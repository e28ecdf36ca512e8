//! Knot error abstractions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::models::catalog::CatalogError;
use crate::models::lifecycle::LifecycleState;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The container runtime could not start the requested process.
    #[error("failed to spawn {0}")]
    SpawnFailed(String),
    /// The container runtime was denied access to the shared session directory.
    #[error("filesystem access denied: {0}")]
    FilesystemAccessDenied(String),
    /// The target image could not be installed.
    #[error("install failed: {0}")]
    InstallFailed(String),
    /// The tap exited unsuccessfully while in discovery mode.
    #[error("tap error: {0}")]
    TapError(String),
    /// The tap produced output which is not a valid catalog.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    /// The tap produced no output and did not exit within the configured interval.
    #[error("discovery timed out after {0} seconds without output")]
    DiscoveryTimeout(u64),
    /// A catalog integrity violation.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The requested action is not valid from the session's current state.
    #[error("cannot {action} while session is {state}")]
    InvalidTransition { state: LifecycleState, action: &'static str },
    /// The target configuration step failed.
    #[error("configure failed: {0}")]
    ConfigureFailed(String),
    /// The session specified in the path is not known.
    #[error("the given session is unknown")]
    UnknownSession,
    /// The operation was cancelled by a reconfiguration or shutdown of the session.
    #[error("operation cancelled by session reset")]
    Cancelled,
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

/// An error body returned to HTTP clients.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::Catalog(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::UnknownSession => StatusCode::NOT_FOUND,
            AppError::SpawnFailed(_) | AppError::FilesystemAccessDenied(_) | AppError::InstallFailed(_) | AppError::ConfigureFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::TapError(_) | AppError::InvalidSchema(_) | AppError::DiscoveryTimeout(_) => StatusCode::BAD_GATEWAY,
            AppError::Cancelled => StatusCode::CONFLICT,
            AppError::Ise(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Translate the given error as an app error, wrapping unknown errors as an ISE.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        err.downcast::<Self>().unwrap_or_else(Self::Ise)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Ise(err) = &self {
            tracing::error!(error = ?err, "internal server error");
        }
        (self.status_code(), Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// A result type used with the HTTP server.
pub type ServerResult<T> = ::std::result::Result<T, AppError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
