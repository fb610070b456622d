//! Result backend layer for Quarry
//!
//! Query jobs never talk to a relational engine directly. Everything goes
//! through [`DatabaseAdapter`], which the PostgreSQL backend and the
//! in-process [`MemoryAdapter`] implement.
//!
//! # Usage
//!
//! ```rust,ignore
//! use quarry_db::{DatabaseAdapter, PostgresAdapter};
//!
//! let adapter = PostgresAdapter::connect("postgres://localhost/results").await?;
//! let sql = adapter.build_query("quarry_user_alice", "t1", "SELECT 1", 10.0, None);
//! let mut session = adapter.begin_query().await?;
//! session.execute(&sql).await?;
//! ```

mod adapter;
mod error;
mod types;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sql;

pub use adapter::{DatabaseAdapter, QuerySession, TableScan};
pub use error::{AdapterError, Result};
pub use memory::MemoryAdapter;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;
pub use types::*;
