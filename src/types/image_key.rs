// ABOUTME: Validated identity key of a cached image: (system, image type, tag).
// ABOUTME: Rejects empty, oversized, and path-escaping components.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

const MAX_NAME_LEN: usize = 64;
const MAX_TAG_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageKeyError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("{field} exceeds maximum length of {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("invalid character in {field}: {ch:?}")]
    InvalidChar { field: &'static str, ch: char },

    #[error("tag cannot start with '/'")]
    LeadingSlash,

    #[error("tag cannot contain a '..' path segment")]
    ParentSegment,
}

/// Identity of one cache entry. At most one record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageKey {
    system: String,
    itype: String,
    tag: String,
}

impl ImageKey {
    pub fn new(system: &str, itype: &str, tag: &str) -> Result<Self, ImageKeyError> {
        validate_name("system", system)?;
        validate_name("itype", itype)?;
        validate_tag(tag)?;

        Ok(Self::from_parts(system, itype, tag))
    }

    /// Build a key from parts already validated (e.g. read back from the store).
    pub(crate) fn from_parts(system: &str, itype: &str, tag: &str) -> Self {
        Self {
            system: system.to_string(),
            itype: itype.to_string(),
            tag: tag.to_string(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn itype(&self) -> &str {
        &self.itype
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.system, self.itype, self.tag)
    }
}

/// Check that `system` is usable as a platform name and queue name.
pub fn validate_system(system: &str) -> Result<(), ImageKeyError> {
    validate_name("system", system)
}

fn validate_name(field: &'static str, value: &str) -> Result<(), ImageKeyError> {
    if value.is_empty() {
        return Err(ImageKeyError::Empty(field));
    }

    if value.len() > MAX_NAME_LEN {
        return Err(ImageKeyError::TooLong {
            field,
            max: MAX_NAME_LEN,
        });
    }

    match value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        Some(ch) => Err(ImageKeyError::InvalidChar { field, ch }),
        None => Ok(()),
    }
}

fn validate_tag(tag: &str) -> Result<(), ImageKeyError> {
    if tag.is_empty() {
        return Err(ImageKeyError::Empty("tag"));
    }

    if tag.len() > MAX_TAG_LEN {
        return Err(ImageKeyError::TooLong {
            field: "tag",
            max: MAX_TAG_LEN,
        });
    }

    if let Some(ch) = tag.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(ImageKeyError::InvalidChar { field: "tag", ch });
    }

    if tag.starts_with('/') {
        return Err(ImageKeyError::LeadingSlash);
    }

    if tag.split('/').any(|segment| segment == "..") {
        return Err(ImageKeyError::ParentSegment);
    }

    Ok(())
}
