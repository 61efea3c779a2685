// ABOUTME: Application-wide error types for imagegw startup and configuration.
// ABOUTME: Uses thiserror; request-path failures live in orchestrator::OrchestratorError.

use std::path::PathBuf;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("failed to read secret file {path}: {source}")]
    SecretFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("record store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("dispatcher unavailable: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("server error: {0}")]
    Server(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
