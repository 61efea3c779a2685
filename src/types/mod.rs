// ABOUTME: Type-safe identifiers and validated domain types.
// ABOUTME: Uses phantom types to prevent ID confusion at compile time.

mod id;
mod image_key;

pub use id::{Id, RecordId, RecordMarker, TaskHandle, TaskMarker};
pub use image_key::{ImageKey, ImageKeyError, validate_system};
