//! Shared building blocks.
//!
//! - [`catalog`]: catalog, change tracking and database metadata queries
//! - [`identifier`]: identifier validation, quoting and literal rendering
//! - [`pool`]: tiberius connections behind a bb8 pool, plus operation timeouts

pub mod catalog;
pub mod identifier;
pub mod pool;

pub use pool::{with_timeout, MssqlConn, MssqlPool};
