//! Job identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid job ID '{value}': {reason}")]
pub struct IdParseError {
    value: String,
    reason: String,
}

/// A random UUID in lowercase hyphenated form.
///
/// The same string is the task id on the dispatch backend, so a job never
/// has more than one live task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Accepts any UUID spelling and stores the canonical one.
    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        let uuid = Uuid::parse_str(value.trim()).map_err(|e| IdParseError {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
