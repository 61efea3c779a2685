// ABOUTME: Image status state machine and its forward-only ordering.
// ABOUTME: UNKNOWN -> ENQUEUED -> PENDING -> READY | FAILURE.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted lifecycle status of an image record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    /// Record exists but no fetch has been submitted.
    Unknown,
    /// Fetch submitted, not yet picked up by a worker.
    Enqueued,
    /// A worker is fetching the image.
    Pending,
    /// Image is in the cache.
    Ready,
    /// The last fetch failed.
    Failure,
}

impl ImageStatus {
    fn rank(self) -> u8 {
        match self {
            ImageStatus::Unknown => 0,
            ImageStatus::Enqueued => 1,
            ImageStatus::Pending => 2,
            ImageStatus::Ready | ImageStatus::Failure => 3,
        }
    }

    /// Whether moving to `next` is a forward step of the state machine.
    ///
    /// Terminal states never advance, so a late report cannot move a READY
    /// record to FAILURE or back to PENDING.
    pub fn can_advance_to(self, next: ImageStatus) -> bool {
        next.rank() > self.rank()
    }

    /// A fetch was submitted and its outcome is still unknown.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ImageStatus::Enqueued | ImageStatus::Pending)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Ready | ImageStatus::Failure)
    }

    /// A pull on a record in this status submits a new fetch.
    pub fn needs_fetch(self) -> bool {
        matches!(self, ImageStatus::Unknown | ImageStatus::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Unknown => "UNKNOWN",
            ImageStatus::Enqueued => "ENQUEUED",
            ImageStatus::Pending => "PENDING",
            ImageStatus::Ready => "READY",
            ImageStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
