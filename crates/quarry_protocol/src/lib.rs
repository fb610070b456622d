//! Shared vocabulary for Quarry crates.
//!
//! Job phases, job kinds, identities and access levels live here so the
//! store, the scheduler, the worker and the CLI agree on their string forms.

pub mod defaults;
pub mod ids;
pub mod types;

pub use ids::{IdParseError, JobId};
pub use types::{display_name, AccessLevel, Identity, JobType, Phase, ANONYMOUS};
