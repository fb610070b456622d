//! CLI command implementations.

pub mod context;
pub mod jobs;
pub mod output;
pub mod results;
pub mod worker;
