//! Persisted sync versions.
//!
//! - [`backend`]: the [`VersionStore`] trait
//! - [`mssql_db`]: the SQL Server implementation stored in each target

pub mod backend;
pub mod mssql_db;

pub use backend::VersionStore;
pub use mssql_db::MssqlVersionStore;
