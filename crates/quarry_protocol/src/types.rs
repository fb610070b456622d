//! Canonical enums and identity types (used across all crates)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Display name used for jobs without an owner.
pub const ANONYMOUS: &str = "anonymous";

// ============================================================================
// Job phase
// ============================================================================

/// Lifecycle phase of a job.
/// This is the CANONICAL definition - the store persists `as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Created and (possibly) processed, not yet handed to the dispatcher
    #[default]
    Pending,
    /// Dispatched, waiting for a worker
    Queued,
    /// A worker is running the job
    Executing,
    Completed,
    Error,
    Aborted,
    /// Result dropped; only the job record remains
    Archived,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Pending,
        Phase::Queued,
        Phase::Executing,
        Phase::Completed,
        Phase::Error,
        Phase::Aborted,
        Phase::Archived,
    ];

    /// Phases that can be aborted.
    pub const ACTIVE: [Phase; 2] = [Phase::Queued, Phase::Executing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "PENDING",
            Phase::Queued => "QUEUED",
            Phase::Executing => "EXECUTING",
            Phase::Completed => "COMPLETED",
            Phase::Error => "ERROR",
            Phase::Aborted => "ABORTED",
            Phase::Archived => "ARCHIVED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Queued | Phase::Executing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Error | Phase::Aborted | Phase::Archived
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Phase::Pending),
            "QUEUED" => Ok(Phase::Queued),
            "EXECUTING" => Ok(Phase::Executing),
            "COMPLETED" => Ok(Phase::Completed),
            "ERROR" => Ok(Phase::Error),
            "ABORTED" => Ok(Phase::Aborted),
            "ARCHIVED" => Ok(Phase::Archived),
            _ => Err(format!("Invalid job phase: '{}'", s)),
        }
    }
}

// ============================================================================
// Job type
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Query,
    Download,
    Archive,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Query => "QUERY",
            JobType::Download => "DOWNLOAD",
            JobType::Archive => "ARCHIVE",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUERY" => Ok(JobType::Query),
            "DOWNLOAD" => Ok(JobType::Download),
            "ARCHIVE" => Ok(JobType::Archive),
            _ => Err(format!("Invalid job type: '{}'", s)),
        }
    }
}

// ============================================================================
// Access control
// ============================================================================

/// Visibility of queues, examples and file directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    /// Everybody, including anonymous submitters
    #[default]
    Public,
    /// Every authenticated user
    Internal,
    /// Members of the listed groups only
    Private,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Public => "PUBLIC",
            AccessLevel::Internal => "INTERNAL",
            AccessLevel::Private => "PRIVATE",
        }
    }

    /// Whether `identity` passes this level, given the groups allowed at PRIVATE.
    pub fn permits(&self, identity: Option<&Identity>, groups: &[String]) -> bool {
        match self {
            AccessLevel::Public => true,
            AccessLevel::Internal => identity.is_some(),
            AccessLevel::Private => identity
                .map(|identity| identity.in_any_group(groups))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An authenticated submitter. Anonymous submitters are `None` wherever an
/// `Option<Identity>` appears.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    pub fn in_any_group(&self, groups: &[String]) -> bool {
        groups.iter().any(|g| self.in_group(g))
    }
}

/// Username of an optional identity, "anonymous" when absent.
pub fn display_name(identity: Option<&Identity>) -> &str {
    identity.map(|i| i.username.as_str()).unwrap_or(ANONYMOUS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_string_roundtrip() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("RUNNING".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&Phase::Executing).unwrap(),
            "\"EXECUTING\""
        );
    }

    #[test]
    fn test_active_and_terminal_are_disjoint() {
        for phase in Phase::ALL {
            assert!(!(phase.is_active() && phase.is_terminal()), "{phase}");
        }
        assert!(!Phase::Pending.is_active());
        assert!(!Phase::Pending.is_terminal());
    }

    #[test]
    fn test_access_levels() {
        let alice = Identity::new("alice").with_groups(["astro"]);
        let groups = vec!["astro".to_string()];

        assert!(AccessLevel::Public.permits(None, &[]));
        assert!(!AccessLevel::Internal.permits(None, &[]));
        assert!(AccessLevel::Internal.permits(Some(&alice), &[]));
        assert!(AccessLevel::Private.permits(Some(&alice), &groups));
        assert!(!AccessLevel::Private.permits(Some(&Identity::new("bob")), &groups));
        assert!(!AccessLevel::Private.permits(None, &groups));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(None), "anonymous");
        assert_eq!(display_name(Some(&Identity::new("alice"))), "alice");
    }
}
