// ABOUTME: Configuration types and parsing for imagegw.yml.
// ABOUTME: Handles YAML/JSON parsing, platform lists, backend selection, and env interpolation.

mod secret;

pub use secret::SecretSource;

use crate::auth::Principal;
use crate::dispatch::QueueSpec;
use crate::error::{Error, Result};
use crate::types::validate_system;
use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "IMAGEGW_CONFIG";
pub const CONFIG_FILENAME: &str = "imagegw.yml";
pub const CONFIG_FILENAME_ALT: &str = "imagegw.yaml";
pub const CONFIG_FILENAME_JSON: &str = "imagegw.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_platforms")]
    pub platforms: NonEmpty<PlatformConfig>,

    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    pub authentication: AuthConfig,

    #[serde(default)]
    pub store: StoreConfig,

    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// A target system with its own fetch queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    /// Overrides `dispatcher.workers_per_system` for this queue.
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum AuthConfig {
    SharedSecret { secret: SecretSource },
    Tokens { tokens: HashMap<String, Principal> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    pub fetch_command: PathBuf,

    #[serde(default)]
    pub fetch_args: Vec<String>,

    #[serde(default = "default_workers")]
    pub workers_per_system: usize,

    /// Upper bound on one status poll.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    #[serde(default)]
    pub journal: Option<PathBuf>,

    /// How long a finished job stays resolvable if its record never collects it.
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullConfig {
    /// Resubmit a pull whose job sat ENQUEUED longer than this. Off when unset.
    #[serde(default, with = "humantime_serde")]
    pub resubmit_after: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default, with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            sweep_interval: None,
            concurrency: default_concurrency(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5555))
}

fn default_auth_header() -> String {
    "authentication".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_retention() -> Duration {
    crate::dispatch::DEFAULT_RETENTION
}

fn default_concurrency() -> usize {
    8
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load from `$IMAGEGW_CONFIG` if set, else the first config file found in `dir`.
    pub fn discover(dir: &Path) -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(Error::ConfigNotFound(path));
            }
            return Self::load(&path);
        }

        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_JSON),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for platform in self.platforms.iter() {
            validate_system(&platform.name)
                .map_err(|e| Error::InvalidConfig(format!("platform {:?}: {}", platform.name, e)))?;
            if !seen.insert(platform.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate platform: {}",
                    platform.name
                )));
            }
            if platform.workers == Some(0) {
                return Err(Error::InvalidConfig(format!(
                    "platform {} needs at least one worker",
                    platform.name
                )));
            }
        }

        if self.dispatcher.workers_per_system == 0 {
            return Err(Error::InvalidConfig(
                "dispatcher.workers_per_system must be at least 1".to_string(),
            ));
        }
        if self.refresh.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "refresh.concurrency must be at least 1".to_string(),
            ));
        }
        if self.auth_header.trim().is_empty() {
            return Err(Error::InvalidConfig("auth_header cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Names of every configured system.
    pub fn platform_names(&self) -> NonEmpty<String> {
        self.platforms.clone().map(|p| p.name)
    }

    /// One dispatcher queue per platform.
    pub fn queue_specs(&self) -> Vec<QueueSpec> {
        self.platforms
            .iter()
            .map(|p| QueueSpec {
                system: p.name.clone(),
                workers: p.workers.unwrap_or(self.dispatcher.workers_per_system),
            })
            .collect()
    }
}

// Custom deserializers

fn deserialize_platforms<'de, D>(
    deserializer: D,
) -> std::result::Result<NonEmpty<PlatformConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<PlatformEntry> = Vec::deserialize(deserializer)?;
    let platforms = values
        .into_iter()
        .map(PlatformEntry::into_platform_config)
        .collect();

    NonEmpty::from_vec(platforms)
        .ok_or_else(|| serde::de::Error::custom("at least one platform is required"))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlatformEntry {
    Simple(String),
    Detailed(PlatformConfig),
}

impl PlatformEntry {
    fn into_platform_config(self) -> PlatformConfig {
        match self {
            PlatformEntry::Simple(name) => PlatformConfig {
                name,
                workers: None,
            },
            PlatformEntry::Detailed(c) => c,
        }
    }
}
