//! Identifier validation and quoting for dynamically built T-SQL.
//!
//! Table and column names cannot be bound as parameters, so every statement
//! the engine generates splices identifiers into text. Identifiers reaching
//! the generator come from the catalog (`QUOTENAME` output or `sys.columns`),
//! never straight from configuration; configured table names are only ever
//! bound as `@P1` parameters when resolving them against the catalog.
//!
//! The helpers here:
//! 1. Validate identifiers for suspicious patterns (null bytes, excessive length)
//! 2. Apply bracket quoting with `]` escaped as `]]`
//! 3. Render `N'...'` string literals with `'` escaped as `''`

use crate::error::{Result, SyncError};

/// SQL Server identifier limit (characters).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers longer than SQL Server allows.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(SyncError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// assert_eq!(quote_mssql("table]name")?, "[table]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Qualify a SQL Server table name with schema.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Render a Unicode string literal: `N'O''Brien'`.
pub fn string_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// Flatten a table name into something usable inside another identifier:
/// brackets removed, parts joined with `.` (`[dbo].[Orders]` -> `dbo.Orders`).
pub fn sanitize_table_name(name: &str) -> String {
    name.chars().filter(|c| *c != '[' && *c != ']').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_mssql_escapes_brackets() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("table]name").unwrap(), "[table]]name]");
        assert!(quote_mssql("").is_err());
        assert!(quote_mssql("bad\0name").is_err());
        assert!(quote_mssql(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_qualify_mssql() {
        assert_eq!(qualify_mssql("sync", "TableVersion").unwrap(), "[sync].[TableVersion]");
    }

    #[test]
    fn test_string_literal_escapes_quotes() {
        assert_eq!(string_literal("[dbo].[O'Brien]"), "N'[dbo].[O''Brien]'");
    }

    #[test]
    fn test_sanitize_table_name() {
        assert_eq!(sanitize_table_name("[dbo].[Orders]"), "dbo.Orders");
    }
}
