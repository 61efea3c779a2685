// ABOUTME: Persisted image record: identity, provenance, status, and fetch metadata.
// ABOUTME: Owns the status-transition helpers the orchestrator applies before writing.

mod status;

pub use status::ImageStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::TaskPhase;
use crate::types::{ImageKey, RecordId, TaskHandle};

pub const DEFAULT_FORMAT: &str = "ext4";
pub const DEFAULT_ARCH: &str = "amd64";
pub const DEFAULT_OS: &str = "linux";
pub const DEFAULT_REMOTETYPE: &str = "dockerv2";
pub const DEFAULT_OSTCOUNT: &str = "0";
pub const DEFAULT_REPLICATION: &str = "1";

/// Caller-supplied fields merged over the record defaults on pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullOptions {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub remotetype: Option<String>,
    #[serde(default)]
    pub ostcount: Option<String>,
    #[serde(default)]
    pub replication: Option<String>,
    #[serde(default, rename = "userAcl")]
    pub user_acl: Option<Vec<String>>,
    #[serde(default, rename = "groupAcl")]
    pub group_acl: Option<Vec<String>>,
}

/// One entry per distinct image key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: RecordId,
    pub system: String,
    pub itype: String,
    pub tag: String,
    pub status: ImageStatus,

    #[serde(rename = "userAcl", default)]
    pub user_acl: Vec<String>,
    #[serde(rename = "groupAcl", default)]
    pub group_acl: Vec<String>,

    pub format: String,
    pub arch: String,
    pub os: String,
    pub location: String,
    pub remotetype: String,
    pub ostcount: String,
    pub replication: String,

    #[serde(rename = "ENV", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "ENTRY", default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(rename = "WORKDIR", default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pull: Option<DateTime<Utc>>,

    /// Dispatcher handle of the most recent submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every write; used for compare-and-swap.
    #[serde(default)]
    pub revision: u64,
}

impl ImageRecord {
    /// A fresh UNKNOWN record with default metadata and caller overrides.
    pub fn new(key: &ImageKey, options: &PullOptions) -> Self {
        let mut record = Self {
            id: RecordId::generate(),
            system: key.system().to_string(),
            itype: key.itype().to_string(),
            tag: key.tag().to_string(),
            status: ImageStatus::Unknown,
            user_acl: Vec::new(),
            group_acl: Vec::new(),
            format: DEFAULT_FORMAT.to_string(),
            arch: DEFAULT_ARCH.to_string(),
            os: DEFAULT_OS.to_string(),
            location: String::new(),
            remotetype: DEFAULT_REMOTETYPE.to_string(),
            ostcount: DEFAULT_OSTCOUNT.to_string(),
            replication: DEFAULT_REPLICATION.to_string(),
            env: None,
            entry: None,
            workdir: None,
            last_pull: None,
            task: None,
            enqueued_at: None,
            revision: 0,
        };
        record.merge_options(options);
        record
    }

    pub fn key(&self) -> ImageKey {
        ImageKey::from_parts(&self.system, &self.itype, &self.tag)
    }

    fn merge_options(&mut self, options: &PullOptions) {
        let fields = [
            (&mut self.format, &options.format),
            (&mut self.arch, &options.arch),
            (&mut self.os, &options.os),
            (&mut self.location, &options.location),
            (&mut self.remotetype, &options.remotetype),
            (&mut self.ostcount, &options.ostcount),
            (&mut self.replication, &options.replication),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                field.clone_from(value);
            }
        }
        if let Some(acl) = &options.user_acl {
            self.user_acl.clone_from(acl);
        }
        if let Some(acl) = &options.group_acl {
            self.group_acl.clone_from(acl);
        }
    }

    /// Restart the state machine for a new submission.
    ///
    /// Returns `None` when the record is not eligible: only UNKNOWN, FAILURE,
    /// or a stalled ENQUEUED record may be (re)enqueued.
    pub fn enqueue(&self, options: &PullOptions, stalled: bool) -> Option<ImageRecord> {
        let eligible = self.status.needs_fetch() || (stalled && self.status == ImageStatus::Enqueued);
        if !eligible {
            return None;
        }

        let mut next = self.clone();
        next.merge_options(options);
        next.status = ImageStatus::Enqueued;
        next.task = None;
        next.enqueued_at = Some(Utc::now());
        Some(next)
    }

    /// Whether an ENQUEUED record has waited longer than `limit` without a
    /// worker picking it up.
    pub fn is_stalled(&self, limit: chrono::Duration) -> bool {
        self.status == ImageStatus::Enqueued
            && self
                .enqueued_at
                .is_none_or(|at| Utc::now() - at > limit)
    }

    /// Apply a dispatcher report.
    ///
    /// Returns the advanced record, or `None` when the report would not move
    /// the status forward (stale or repeated report).
    pub fn observe(&self, phase: &TaskPhase) -> Option<ImageRecord> {
        let target = phase.status();
        if !self.status.can_advance_to(target) {
            return None;
        }

        let mut next = self.clone();
        next.status = target;
        if let TaskPhase::Succeeded(output) = phase {
            next.env = Some(output.env.clone());
            next.entry = output.entry.clone();
            next.workdir = output.workdir.clone();
            next.last_pull = Some(Utc::now());
        }
        Some(next)
    }
}
