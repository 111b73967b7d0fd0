//! Upload session types and lifecycle.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidUploadId(format!("{s}: {e}")))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Accepting chunks.
    Open,
    /// A commit holds the session; chunk writes are refused.
    Committing,
    /// Bytes were finalized into the entry.
    Committed,
    /// Swept or discarded without completing.
    Abandoned,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Check if the session can still receive chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Abandoned)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "committing" => Ok(Self::Committing),
            "committed" => Ok(Self::Committed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(Error::InvalidState(format!("unknown upload state: {other}"))),
        }
    }
}

/// A contiguous span of bytes within an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Result<Self> {
        if offset.checked_add(len).is_none() {
            return Err(Error::InvalidRange(format!(
                "offset {offset} + length {len} overflows"
            )));
        }
        Ok(Self { offset, len })
    }

    /// Build from an inclusive `start-end` pair as sent in `Content-Range`.
    pub fn from_inclusive(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidRange(format!("{start}-{end}")));
        }
        let len = (end - start)
            .checked_add(1)
            .ok_or_else(|| Error::InvalidRange(format!("{start}-{end} is too long")))?;
        Self::new(start, len)
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Why a set of received ranges does not form a complete object.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum CoverageError {
    #[error("no data received")]
    Empty,

    #[error("missing bytes at offset {at}")]
    Gap { at: u64 },

    #[error("overlapping ranges at offset {at}")]
    Overlap { at: u64 },

    #[error("received {covered} bytes, expected {expected}")]
    SizeMismatch { expected: u64, covered: u64 },
}

/// Check that `ranges` tile `[0, size)` exactly, returning the size.
///
/// `ranges` must already be sorted by offset. When `declared` is given the
/// covered length must equal it.
pub fn check_coverage(
    ranges: &[ByteRange],
    declared: Option<u64>,
) -> std::result::Result<u64, CoverageError> {
    let mut cursor = 0u64;
    for range in ranges {
        if range.offset > cursor {
            return Err(CoverageError::Gap { at: cursor });
        }
        if range.offset < cursor {
            return Err(CoverageError::Overlap { at: range.offset });
        }
        cursor = range.end();
    }

    match declared {
        Some(expected) if expected != cursor => Err(CoverageError::SizeMismatch {
            expected,
            covered: cursor,
        }),
        Some(_) => Ok(cursor),
        None if ranges.is_empty() => Err(CoverageError::Empty),
        None => Ok(cursor),
    }
}
