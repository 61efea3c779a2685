// ABOUTME: Fetch worker capability and an external-command implementation.
// ABOUTME: The command gets the job via IMAGEGW_* env vars and prints JSON metadata on stdout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{FetchJob, FetchOutput};

/// Errors from a fetch attempt.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to start fetch command {path}: {reason}")]
    Spawn { path: PathBuf, reason: String },

    #[error("fetch command exited with {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid fetch output: {0}")]
    InvalidOutput(String),

    #[error("fetch failed: {0}")]
    Other(String),
}

/// Pulls an image into the cache. The registry and filesystem work lives
/// behind this trait.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, job: &FetchJob) -> Result<FetchOutput, FetchError>;
}

/// Runs an executable per job.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn job_env(job: &FetchJob) -> HashMap<&'static str, String> {
        let mut env = HashMap::new();
        env.insert("IMAGEGW_RECORD_ID", job.record_id.to_string());
        env.insert("IMAGEGW_SYSTEM", job.system.clone());
        env.insert("IMAGEGW_ITYPE", job.itype.clone());
        env.insert("IMAGEGW_TAG", job.tag.clone());
        env.insert("IMAGEGW_FORMAT", job.format.clone());
        env.insert("IMAGEGW_ARCH", job.arch.clone());
        env.insert("IMAGEGW_OS", job.os.clone());
        env.insert("IMAGEGW_LOCATION", job.location.clone());
        env.insert("IMAGEGW_REMOTETYPE", job.remotetype.clone());
        env.insert("IMAGEGW_OSTCOUNT", job.ostcount.clone());
        env.insert("IMAGEGW_REPLICATION", job.replication.clone());
        env
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self, job: &FetchJob) -> Result<FetchOutput, FetchError> {
        tracing::info!(
            program = %self.program.display(),
            system = %job.system,
            itype = %job.itype,
            tag = %job.tag,
            "Running fetch command"
        );

        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(Self::job_env(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Err(_) => return Err(FetchError::Timeout(self.timeout)),
            Ok(Err(e)) => {
                return Err(FetchError::Spawn {
                    path: self.program.clone(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(FetchError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(FetchOutput::default());
        }

        serde_json::from_str(stdout.trim()).map_err(|e| FetchError::InvalidOutput(e.to_string()))
    }
}
