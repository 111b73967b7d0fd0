//! Cache entry identity and lifecycle.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest accepted cache key or version, in characters.
pub const MAX_KEY_LENGTH: usize = 512;

/// The (key, version, scope) triple that identifies one cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub key: String,
    pub version: String,
    pub scope: String,
}

impl EntryKey {
    /// Build and validate an entry key.
    ///
    /// Keys may not contain commas because lookups pass several keys as a
    /// comma-separated list.
    pub fn new(
        key: impl Into<String>,
        version: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Self> {
        let entry = Self {
            key: key.into(),
            version: version.into(),
            scope: scope.into(),
        };
        validate_part("key", &entry.key)?;
        validate_part("version", &entry.version)?;
        validate_part("scope", &entry.scope)?;
        if entry.key.contains(',') {
            return Err(Error::InvalidState(format!(
                "key must not contain ',': {}",
                entry.key
            )));
        }
        Ok(entry)
    }
}

fn validate_part(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidState(format!("{name} must not be empty")));
    }
    if value.chars().count() > MAX_KEY_LENGTH {
        return Err(Error::InvalidState(format!(
            "{name} exceeds {MAX_KEY_LENGTH} characters"
        )));
    }
    Ok(())
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} [{}]", self.key, self.version, self.scope)
    }
}

/// Cache entry lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Reserved; an upload is in flight.
    Pending,
    /// Bytes are finalized and the entry is visible to lookups.
    Committed,
    /// Abandoned or being evicted; never visible to lookups.
    Expired,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Expired => "expired",
        }
    }

    /// Whether this entry still holds its (key, version, scope) triple.
    pub fn holds_key(&self) -> bool {
        matches!(self, Self::Pending | Self::Committed)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "committed" => Ok(Self::Committed),
            "expired" => Ok(Self::Expired),
            other => Err(Error::InvalidState(format!("unknown entry state: {other}"))),
        }
    }
}
