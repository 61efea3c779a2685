// ABOUTME: Orchestrator error types with SNAFU pattern.
// ABOUTME: A closed set of failure kinds that callers can tell apart.

use snafu::Snafu;

use crate::auth::AuthError;
use crate::dispatch::DispatchError;
use crate::store::StoreError;
use crate::types::ImageKeyError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OrchestratorError {
    #[snafu(display("authentication failed: {source}"))]
    Auth { source: AuthError },

    #[snafu(display("unknown system: {system}"))]
    UnknownSystem { system: String },

    #[snafu(display("not found: {what}"))]
    NotFound { what: String },

    #[snafu(display("fetch dispatch failed: {source}"))]
    Dispatch { source: DispatchError },

    #[snafu(display("invalid image key: {source}"))]
    Validation { source: ImageKeyError },

    #[snafu(display("record store failure: {source}"))]
    Store { source: StoreError },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing credential.
    AuthFailure,
    /// The system is not a configured platform.
    UnknownSystem,
    /// No record for the key or id.
    NotFound,
    /// The dispatcher refused or could not report on a job.
    DispatchFailure,
    /// Malformed key fields.
    ValidationError,
    /// The record store failed.
    StoreFailure,
}

impl OrchestratorError {
    /// Returns the error kind for programmatic handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Auth { .. } => ErrorKind::AuthFailure,
            OrchestratorError::UnknownSystem { .. } => ErrorKind::UnknownSystem,
            OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::Dispatch { .. } => ErrorKind::DispatchFailure,
            OrchestratorError::Validation { .. } => ErrorKind::ValidationError,
            OrchestratorError::Store { .. } => ErrorKind::StoreFailure,
        }
    }
}

impl From<AuthError> for OrchestratorError {
    fn from(source: AuthError) -> Self {
        OrchestratorError::Auth { source }
    }
}

impl From<ImageKeyError> for OrchestratorError {
    fn from(source: ImageKeyError) -> Self {
        OrchestratorError::Validation { source }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(source: StoreError) -> Self {
        OrchestratorError::Store { source }
    }
}

impl From<DispatchError> for OrchestratorError {
    fn from(source: DispatchError) -> Self {
        OrchestratorError::Dispatch { source }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
